//! Self-signed certificate generation.
//!
//! quiche loads TLS material from PEM files, so generated pairs are
//! written to a directory and handed over as [`TlsCredentials`].

use std::path::Path;

use crate::error::{Error, Result};
use crate::transport::TlsCredentials;

/// Generate a self-signed certificate and return (cert_pem, key_pem).
pub fn generate_self_signed_cert(names: &[&str]) -> Result<(Vec<u8>, Vec<u8>)> {
    let names: Vec<String> = if names.is_empty() {
        vec!["localhost".to_string()]
    } else {
        names.iter().map(|n| n.to_string()).collect()
    };

    let certified_key = rcgen::generate_simple_self_signed(names).map_err(|e| Error::Tls {
        message: format!("failed to generate certificate: {}", e),
    })?;

    let cert_pem = certified_key.cert.pem().into_bytes();
    let key_pem = certified_key.signing_key.serialize_pem().into_bytes();

    Ok((cert_pem, key_pem))
}

/// Generate a self-signed pair and write it as `cert.pem` / `key.pem` in `dir`.
pub fn write_self_signed_cert(dir: &Path, names: &[&str]) -> Result<TlsCredentials> {
    let (cert_pem, key_pem) = generate_self_signed_cert(names)?;

    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert_pem)?;
    std::fs::write(&key_path, key_pem)?;

    Ok(TlsCredentials::new(cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_self_signed_cert_works() {
        let (cert, key) = generate_self_signed_cert(&["localhost"]).unwrap();
        assert!(String::from_utf8(cert).unwrap().contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8(key).unwrap().contains("PRIVATE KEY"));
    }

    #[test]
    fn write_self_signed_cert_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let creds = write_self_signed_cert(&dir.path().join("tls"), &[]).unwrap();
        assert!(creds.cert_path.exists());
        assert!(creds.key_path.exists());
    }
}
