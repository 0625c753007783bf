//! Library-agnostic QUIC transport configuration.
//!
//! `TransportConfig` is assembled with a consuming builder or option by
//! option through [`TransportConfig::set_option`], then compiled to a
//! `quiche::Config` by [`TransportConfig::build_quiche_config`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DATAGRAM_QUEUE_LEN, DEFAULT_ALPN, DEFAULT_MAX_DATA, DEFAULT_MAX_RECV_UDP_PAYLOAD_SIZE,
    DEFAULT_MAX_SEND_UDP_PAYLOAD_SIZE, DEFAULT_MAX_STREAM_DATA_BIDI_LOCAL,
    DEFAULT_MAX_STREAM_DATA_BIDI_REMOTE, DEFAULT_MAX_STREAM_DATA_UNI, DEFAULT_MAX_STREAMS_BIDI,
    DEFAULT_MAX_STREAMS_UNI, IDLE_TIMEOUT, MAX_DATAGRAM_FRAME_SIZE, TLS_EXPORT_DIR_ENV,
};
use crate::error::{Error, Result};

use super::{EndpointRole, TransportParams};

/// TLS material for server endpoints, as PEM file paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCredentials {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsCredentials {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

/// QUIC transport configuration for one endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    role: EndpointRole,
    /// `host:port` to connect to, or `addr:port` to bind.
    location: String,
    alpn: Vec<String>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    sni: Option<String>,
    verify_peer: bool,
    idle_timeout: Duration,
    max_recv_udp_payload_size: usize,
    max_send_udp_payload_size: usize,
    max_data: u64,
    max_stream_data_bidi_local: u64,
    max_stream_data_bidi_remote: u64,
    max_stream_data_uni: u64,
    max_streams_bidi: u64,
    max_streams_uni: u64,
    enable_datagram: bool,
    enable_stats: bool,
    stateless_retry: bool,
    tls_export_dir: Option<PathBuf>,
}

impl TransportConfig {
    /// Create a configuration with defaults for `role`.
    ///
    /// The TLS export directory is taken from `GST_QUICLIB_TLS_EXPORT_DIR`
    /// when that variable is set.
    pub fn new(role: EndpointRole, location: impl Into<String>) -> Self {
        Self {
            role,
            location: location.into(),
            alpn: vec![DEFAULT_ALPN.to_string()],
            cert_path: None,
            key_path: None,
            sni: None,
            verify_peer: role == EndpointRole::Client,
            idle_timeout: IDLE_TIMEOUT,
            max_recv_udp_payload_size: DEFAULT_MAX_RECV_UDP_PAYLOAD_SIZE,
            max_send_udp_payload_size: DEFAULT_MAX_SEND_UDP_PAYLOAD_SIZE,
            max_data: DEFAULT_MAX_DATA,
            max_stream_data_bidi_local: DEFAULT_MAX_STREAM_DATA_BIDI_LOCAL,
            max_stream_data_bidi_remote: DEFAULT_MAX_STREAM_DATA_BIDI_REMOTE,
            max_stream_data_uni: DEFAULT_MAX_STREAM_DATA_UNI,
            max_streams_bidi: DEFAULT_MAX_STREAMS_BIDI,
            max_streams_uni: DEFAULT_MAX_STREAMS_UNI,
            enable_datagram: false,
            enable_stats: false,
            stateless_retry: false,
            tls_export_dir: std::env::var_os(TLS_EXPORT_DIR_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Client configuration connecting to `location`.
    pub fn client(location: impl Into<String>) -> Self {
        Self::new(EndpointRole::Client, location)
    }

    /// Server configuration listening on `location`.
    pub fn server(location: impl Into<String>) -> Self {
        Self::new(EndpointRole::Server, location)
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Replace the ALPN list with a single protocol.
    pub fn with_alpn(mut self, alpn: impl Into<String>) -> Self {
        self.alpn = vec![alpn.into()];
        self
    }

    /// Replace the ALPN list.
    pub fn with_alpns<I, S>(mut self, alpns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn = alpns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credentials(mut self, credentials: TlsCredentials) -> Self {
        self.cert_path = Some(credentials.cert_path);
        self.key_path = Some(credentials.key_path);
        self
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    /// Set whether to verify peer certificates (client only).
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_recv_udp_payload_size(mut self, size: usize) -> Self {
        self.max_recv_udp_payload_size = size;
        self
    }

    pub fn with_max_send_udp_payload_size(mut self, size: usize) -> Self {
        self.max_send_udp_payload_size = size;
        self
    }

    /// Connection-wide receive window granted to the peer.
    pub fn with_max_data(mut self, size: u64) -> Self {
        self.max_data = size;
        self
    }

    pub fn with_max_stream_data_bidi_local(mut self, size: u64) -> Self {
        self.max_stream_data_bidi_local = size;
        self
    }

    /// Receive window for bidirectional streams opened by the peer.
    pub fn with_max_stream_data_bidi_remote(mut self, size: u64) -> Self {
        self.max_stream_data_bidi_remote = size;
        self
    }

    pub fn with_max_stream_data_uni(mut self, size: u64) -> Self {
        self.max_stream_data_uni = size;
        self
    }

    /// Number of bidirectional streams the peer may open.
    pub fn with_max_streams_bidi(mut self, count: u64) -> Self {
        self.max_streams_bidi = count;
        self
    }

    /// Number of unidirectional streams the peer may open.
    pub fn with_max_streams_uni(mut self, count: u64) -> Self {
        self.max_streams_uni = count;
        self
    }

    pub fn with_datagrams(mut self, enabled: bool) -> Self {
        self.enable_datagram = enabled;
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.enable_stats = enabled;
        self
    }

    /// Require a stateless retry round trip before accepting (server only).
    pub fn with_stateless_retry(mut self, enabled: bool) -> Self {
        self.stateless_retry = enabled;
        self
    }

    pub fn with_tls_export_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.tls_export_dir = dir;
        self
    }

    /// Apply one option by name.
    ///
    /// Names follow the element property names: `location`, `mode`,
    /// `alpn`, `privkey`, `cert`, `sni`, `max-streams-bidi-remote`,
    /// `max-streams-uni-remote`, `max-stream-data-bidi-remote`,
    /// `max-stream-data-uni-remote`, `max-data-remote`, `enable-datagram`,
    /// `enable-stats`, plus `idle-timeout` (ms), `verify-peer`,
    /// `stateless-retry` and `tls-export-dir`.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "location" => self.location = value.to_string(),
            "mode" => self.role = value.parse()?,
            "alpn" => self.alpn = parse_alpn_list(value)?,
            "privkey" => self.key_path = Some(PathBuf::from(value)),
            "cert" => self.cert_path = Some(PathBuf::from(value)),
            "sni" => self.sni = Some(value.to_string()).filter(|s| !s.is_empty()),
            "max-streams-bidi-remote" => self.max_streams_bidi = parse_u64(name, value)?,
            "max-streams-uni-remote" => self.max_streams_uni = parse_u64(name, value)?,
            "max-stream-data-bidi-remote" => {
                self.max_stream_data_bidi_remote = parse_u64(name, value)?
            }
            "max-stream-data-uni-remote" => self.max_stream_data_uni = parse_u64(name, value)?,
            "max-data-remote" => self.max_data = parse_u64(name, value)?,
            "enable-datagram" => self.enable_datagram = parse_bool(name, value)?,
            "enable-stats" => self.enable_stats = parse_bool(name, value)?,
            "idle-timeout" => {
                self.idle_timeout = Duration::from_millis(parse_u64(name, value)?)
            }
            "verify-peer" => self.verify_peer = parse_bool(name, value)?,
            "stateless-retry" => self.stateless_retry = parse_bool(name, value)?,
            "tls-export-dir" => {
                self.tls_export_dir = Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty())
            }
            other => return Err(Error::config(format!("unknown option: {other}"))),
        }
        Ok(())
    }

    /// Check that the configuration is usable for its role.
    pub fn validate(&self) -> Result<()> {
        if self.location.trim().is_empty() {
            return Err(Error::config("location is empty"));
        }
        if self.alpn.is_empty() {
            return Err(Error::config("at least one ALPN is required"));
        }
        if self.alpn.iter().any(|a| a.is_empty() || a.len() > 255) {
            return Err(Error::config("ALPN entries must be 1..=255 bytes"));
        }
        if self.role == EndpointRole::Server && (self.cert_path.is_none() || self.key_path.is_none())
        {
            return Err(Error::Tls {
                message: "server requires both cert and privkey".to_string(),
            });
        }
        Ok(())
    }

    /// Compile to a quiche configuration.
    pub fn build_quiche_config(&self) -> Result<quiche::Config> {
        self.validate()?;

        let mut config =
            quiche::Config::new(quiche::PROTOCOL_VERSION).map_err(|e| Error::Transport {
                message: format!("failed to create quiche config: {}", e),
            })?;

        let alpns: Vec<&[u8]> = self.alpn.iter().map(|a| a.as_bytes()).collect();
        config
            .set_application_protos(&alpns)
            .map_err(|e| Error::config(format!("failed to set application protos: {}", e)))?;

        if let (Some(cert), Some(key)) = (&self.cert_path, &self.key_path) {
            config
                .load_cert_chain_from_pem_file(path_str(cert)?)
                .map_err(|e| Error::Tls {
                    message: format!("failed to load certificate {}: {}", cert.display(), e),
                })?;
            config
                .load_priv_key_from_pem_file(path_str(key)?)
                .map_err(|e| Error::Tls {
                    message: format!("failed to load private key {}: {}", key.display(), e),
                })?;
        }

        config.verify_peer(self.role == EndpointRole::Client && self.verify_peer);

        config.set_max_idle_timeout(self.idle_timeout.as_millis() as u64);
        config.set_max_recv_udp_payload_size(self.max_recv_udp_payload_size);
        config.set_max_send_udp_payload_size(self.max_send_udp_payload_size);
        config.set_initial_max_data(self.max_data);
        config.set_initial_max_stream_data_bidi_local(self.max_stream_data_bidi_local);
        config.set_initial_max_stream_data_bidi_remote(self.max_stream_data_bidi_remote);
        config.set_initial_max_stream_data_uni(self.max_stream_data_uni);
        config.set_initial_max_streams_bidi(self.max_streams_bidi);
        config.set_initial_max_streams_uni(self.max_streams_uni);
        config.set_disable_active_migration(true);

        if self.enable_datagram {
            config.enable_dgram(true, DATAGRAM_QUEUE_LEN, DATAGRAM_QUEUE_LEN);
        }

        if self.tls_export_dir.is_some() {
            config.log_keys();
        }

        Ok(config)
    }

    /// Transport parameters this configuration advertises.
    pub fn local_params(&self) -> TransportParams {
        TransportParams {
            max_idle_timeout_ms: self.idle_timeout.as_millis() as u64,
            max_udp_payload_size: self.max_recv_udp_payload_size as u64,
            max_data: self.max_data,
            max_stream_data_bidi_local: self.max_stream_data_bidi_local,
            max_stream_data_bidi_remote: self.max_stream_data_bidi_remote,
            max_stream_data_uni: self.max_stream_data_uni,
            max_streams_bidi: self.max_streams_bidi,
            max_streams_uni: self.max_streams_uni,
            max_datagram_frame_size: if self.enable_datagram {
                MAX_DATAGRAM_FRAME_SIZE
            } else {
                0
            },
        }
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn alpn(&self) -> &[String] {
        &self.alpn
    }

    pub fn cert_path(&self) -> Option<&Path> {
        self.cert_path.as_deref()
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    /// Server name for the TLS ClientHello.
    ///
    /// Defaults to the host part of the location.
    pub fn sni(&self) -> Option<String> {
        if let Some(sni) = &self.sni {
            return Some(sni.clone());
        }
        let location = self.location.trim_start_matches("quic://");
        let host = match location.rsplit_once(':') {
            Some((host, _)) => host,
            None => location,
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.parse::<std::net::IpAddr>().is_ok() {
            None
        } else {
            Some(host.to_string())
        }
    }

    pub fn should_verify_peer(&self) -> bool {
        self.verify_peer
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn max_stream_data_bidi_local(&self) -> u64 {
        self.max_stream_data_bidi_local
    }

    pub fn max_stream_data_bidi_remote(&self) -> u64 {
        self.max_stream_data_bidi_remote
    }

    pub fn max_stream_data_uni(&self) -> u64 {
        self.max_stream_data_uni
    }

    pub fn max_streams_bidi(&self) -> u64 {
        self.max_streams_bidi
    }

    pub fn max_streams_uni(&self) -> u64 {
        self.max_streams_uni
    }

    pub fn datagrams_enabled(&self) -> bool {
        self.enable_datagram
    }

    pub fn stats_enabled(&self) -> bool {
        self.enable_stats
    }

    pub fn stateless_retry(&self) -> bool {
        self.stateless_retry
    }

    pub fn tls_export_dir(&self) -> Option<&Path> {
        self.tls_export_dir.as_deref()
    }
}

/// Resolve a `host:port` or `quic://host:port` location to its first
/// socket address.
pub async fn resolve_location(location: &str) -> Result<std::net::SocketAddr> {
    let target = location.trim_start_matches("quic://");
    let mut addrs = tokio::net::lookup_host(target)
        .await
        .map_err(|_| Error::Resolve {
            location: location.to_string(),
        })?;
    addrs.next().ok_or_else(|| Error::Resolve {
        location: location.to_string(),
    })
}

/// Split a comma-separated ALPN list, dropping blanks.
pub fn parse_alpn_list(value: &str) -> Result<Vec<String>> {
    let alpns: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if alpns.is_empty() {
        return Err(Error::config("alpn list is empty"));
    }
    Ok(alpns)
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{name}: expected an unsigned integer, got {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{name}: expected a boolean, got {value:?}"
        ))),
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::config(format!("path is not valid UTF-8: {}", path.display())))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let config = TransportConfig::client("localhost:4433");
        assert_eq!(config.role(), EndpointRole::Client);
        assert!(config.should_verify_peer());
        assert!(!config.datagrams_enabled());
        assert_eq!(config.alpn(), &[DEFAULT_ALPN.to_string()]);
        assert_eq!(config.idle_timeout(), IDLE_TIMEOUT);
    }

    #[test]
    fn server_defaults() {
        let config = TransportConfig::server("0.0.0.0:4433");
        assert_eq!(config.role(), EndpointRole::Server);
        assert!(!config.should_verify_peer());
        assert!(!config.stateless_retry());
    }

    #[test]
    fn set_option_maps_transport_params() {
        let mut config = TransportConfig::server("127.0.0.1:0");
        config.set_option("max-streams-bidi-remote", "7").unwrap();
        config.set_option("max-streams-uni-remote", "3").unwrap();
        config.set_option("max-stream-data-bidi-remote", "100").unwrap();
        config.set_option("max-stream-data-uni-remote", "200").unwrap();
        config.set_option("max-data-remote", "5000").unwrap();
        config.set_option("enable-datagram", "true").unwrap();
        config.set_option("enable-stats", "1").unwrap();

        let tp = config.local_params();
        assert_eq!(tp.max_streams_bidi, 7);
        assert_eq!(tp.max_streams_uni, 3);
        assert_eq!(tp.max_stream_data_bidi_remote, 100);
        assert_eq!(tp.max_stream_data_uni, 200);
        assert_eq!(tp.max_data, 5000);
        assert_eq!(tp.max_datagram_frame_size, 65536);
        assert!(config.stats_enabled());
    }

    #[test]
    fn set_option_alpn_list() {
        let mut config = TransportConfig::server("127.0.0.1:0");
        config.set_option("alpn", "h3, test/1,,").unwrap();
        assert_eq!(config.alpn(), &["h3".to_string(), "test/1".to_string()]);
        assert!(config.set_option("alpn", " , ").is_err());
    }

    #[test]
    fn set_option_mode_and_tls() {
        let mut config = TransportConfig::client("x:1");
        config.set_option("mode", "server").unwrap();
        config.set_option("cert", "/tmp/cert.pem").unwrap();
        config.set_option("privkey", "/tmp/key.pem").unwrap();
        assert_eq!(config.role(), EndpointRole::Server);
        assert_eq!(config.cert_path(), Some(Path::new("/tmp/cert.pem")));
        assert_eq!(config.key_path(), Some(Path::new("/tmp/key.pem")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn set_option_rejects_bad_input() {
        let mut config = TransportConfig::client("x:1");
        assert!(matches!(
            config.set_option("no-such-option", "1"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            config.set_option("max-data-remote", "lots"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            config.set_option("enable-datagram", "maybe"),
            Err(Error::Config { .. })
        ));
        assert!(config.set_option("mode", "peer").is_err());
    }

    #[test]
    fn server_requires_credentials() {
        let config = TransportConfig::server("127.0.0.1:0");
        assert!(matches!(config.validate(), Err(Error::Tls { .. })));
        assert!(config.build_quiche_config().is_err());
    }

    #[test]
    fn client_builds_quiche_config() {
        let config = TransportConfig::client("127.0.0.1:4433")
            .with_alpn("test/1")
            .with_datagrams(true)
            .verify_peer(false);
        assert!(config.build_quiche_config().is_ok());
    }

    #[test]
    fn sni_defaults_to_hostname() {
        assert_eq!(
            TransportConfig::client("localhost:4433").sni().as_deref(),
            Some("localhost")
        );
        assert_eq!(
            TransportConfig::client("quic://example.org:443").sni().as_deref(),
            Some("example.org")
        );
        assert_eq!(TransportConfig::client("127.0.0.1:4433").sni(), None);
        assert_eq!(TransportConfig::client("[::1]:4433").sni(), None);
        assert_eq!(
            TransportConfig::client("127.0.0.1:4433")
                .with_sni("override")
                .sni()
                .as_deref(),
            Some("override")
        );
    }

    #[test]
    fn datagrams_disabled_advertise_zero() {
        let config = TransportConfig::client("x:1");
        assert!(!config.local_params().supports_datagrams());
    }

    #[tokio::test]
    async fn resolves_plain_and_prefixed_locations() {
        let plain = resolve_location("127.0.0.1:4433").await.unwrap();
        assert_eq!(plain, "127.0.0.1:4433".parse().unwrap());
        let prefixed = resolve_location("quic://127.0.0.1:4433").await.unwrap();
        assert_eq!(prefixed, plain);
        assert!(matches!(
            resolve_location("no-port-here").await,
            Err(Error::Resolve { .. })
        ));
    }

}
