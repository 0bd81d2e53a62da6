//! STARTTLS support for the SMTP ingress
//!
//! The receiver prefers its dedicated certificate pair and falls back to
//! the web server's certificate when none is configured, so a single
//! cert can serve both the API and the ingress.

use anyhow::{anyhow, bail, Result};
use mailforge_common::Config;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// The certificate pair the receiver should present, after applying the
/// web-server fallback. None when TLS is off or nothing usable is
/// configured.
pub fn receiver_cert_paths(config: &Config) -> Option<(PathBuf, PathBuf)> {
    if !config.receiver_tls {
        return None;
    }

    let cert = if config.receiver_tls_cert.is_empty() {
        &config.cert_file
    } else {
        &config.receiver_tls_cert
    };
    let key = if config.receiver_tls_key.is_empty() {
        &config.key_file
    } else {
        &config.receiver_tls_key
    };

    if cert.is_empty() || key.is_empty() {
        warn!("Receiver TLS enabled but no certificate configured");
        return None;
    }

    Some((PathBuf::from(cert), PathBuf::from(key)))
}

/// Build the STARTTLS acceptor for the configured receiver certificate.
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| anyhow!("receiver certificate {}: {}", cert_path.display(), e))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("receiver certificate {}: {}", cert_path.display(), e))?;
    if certs.is_empty() {
        bail!("receiver certificate {} holds no certificates", cert_path.display());
    }

    let key_pem = std::fs::read(key_path)
        .map_err(|e| anyhow!("receiver key {}: {}", key_path.display(), e))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| anyhow!("receiver key {}: {}", key_path.display(), e))?
        .ok_or_else(|| anyhow!("receiver key {} holds no private key", key_path.display()))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("receiver TLS config rejected: {}", e))?;

    info!(cert = %cert_path.display(), "Receiver STARTTLS certificate loaded");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_config(receiver_cert: &str, receiver_key: &str, web_cert: &str, web_key: &str) -> Config {
        let mut config = Config::default();
        config.receiver_tls = true;
        config.receiver_tls_cert = receiver_cert.to_string();
        config.receiver_tls_key = receiver_key.to_string();
        config.cert_file = web_cert.to_string();
        config.key_file = web_key.to_string();
        config
    }

    #[test]
    fn dedicated_cert_wins_over_fallback() {
        let config = tls_config("r.crt", "r.key", "w.crt", "w.key");
        let (cert, key) = receiver_cert_paths(&config).unwrap();
        assert_eq!(cert, PathBuf::from("r.crt"));
        assert_eq!(key, PathBuf::from("r.key"));
    }

    #[test]
    fn falls_back_to_web_certificate_per_field() {
        let config = tls_config("", "", "w.crt", "w.key");
        let (cert, key) = receiver_cert_paths(&config).unwrap();
        assert_eq!(cert, PathBuf::from("w.crt"));
        assert_eq!(key, PathBuf::from("w.key"));

        // Mixed: dedicated cert, fallback key.
        let config = tls_config("r.crt", "", "w.crt", "w.key");
        let (cert, key) = receiver_cert_paths(&config).unwrap();
        assert_eq!(cert, PathBuf::from("r.crt"));
        assert_eq!(key, PathBuf::from("w.key"));
    }

    #[test]
    fn disabled_or_unconfigured_yields_none() {
        let mut config = tls_config("r.crt", "r.key", "", "");
        config.receiver_tls = false;
        assert!(receiver_cert_paths(&config).is_none());

        let config = tls_config("", "", "", "");
        assert!(receiver_cert_paths(&config).is_none());
    }

    #[test]
    fn missing_files_are_reported_with_their_role() {
        let err = match create_tls_acceptor(Path::new("/nonexistent.crt"), Path::new("/nonexistent.key")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("receiver certificate /nonexistent.crt"));
    }
}
