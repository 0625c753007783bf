//! Self-signed TLS material for loopback tests.

use quicmux_core::transport::TlsCredentials;
use quicmux_core::transport::common::write_self_signed_cert;
use quicmux_core::TransportConfig;
use tempfile::TempDir;

/// Certificate and key for `localhost`, removed on drop.
pub struct TestCerts {
    dir: TempDir,
    credentials: TlsCredentials,
}

impl TestCerts {
    /// Generate a fresh certificate for `localhost` and `127.0.0.1`.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let credentials = write_self_signed_cert(dir.path(), &["localhost", "127.0.0.1"])
            .expect("write self-signed cert");
        Self { dir, credentials }
    }

    pub fn credentials(&self) -> TlsCredentials {
        self.credentials.clone()
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Server on an ephemeral loopback port accepting `alpns`.
    pub fn server_config(&self, alpns: &[&str]) -> TransportConfig {
        TransportConfig::server("127.0.0.1:0")
            .with_alpns(alpns.iter().copied())
            .with_credentials(self.credentials())
    }

    /// Client to `location` that does not verify the self-signed peer.
    pub fn client_config(location: impl Into<String>, alpn: &str) -> TransportConfig {
        TransportConfig::client(location)
            .with_alpn(alpn)
            .verify_peer(false)
    }
}

impl Default for TestCerts {
    fn default() -> Self {
        Self::new()
    }
}
