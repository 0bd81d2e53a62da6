//! Configuration for Mailforge
//!
//! A single JSON document on disk. Loading fills defaults, rotates weak
//! secrets, and generates a missing DKIM key, then writes the calibrated
//! file back with owner-only permissions.

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

/// Secrets that must never survive a config load.
const WEAK_SECRET_FINGERPRINTS: &[&str] = &["mailforge-secret-", "change-this-secret"];

/// Main configuration structure. Field order defines the on-disk JSON
/// order; a load/save cycle is byte-stable for non-generative fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Primary sending domain
    #[serde(default = "default_domain")]
    pub domain: String,

    /// DKIM selector for the process-wide key
    #[serde(default = "default_dkim_selector")]
    pub dkim_selector: String,

    /// Process-wide DKIM private key (PEM), generated when absent
    #[serde(default)]
    pub dkim_private_key: String,

    /// HTTP bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: String,

    /// Public base URL used in tracking links (empty = derived from host:port)
    #[serde(default)]
    pub base_url: String,

    /// Serve the HTTP API over TLS
    #[serde(default)]
    pub enable_ssl: bool,

    #[serde(default)]
    pub cert_file: String,

    #[serde(default)]
    pub key_file: String,

    /// Run the SMTP ingress server
    #[serde(default)]
    pub enable_receiver: bool,

    /// SMTP ingress port
    #[serde(default = "default_receiver_port")]
    pub receiver_port: String,

    /// Advertise and accept STARTTLS on the ingress
    #[serde(default)]
    pub receiver_tls: bool,

    #[serde(default)]
    pub receiver_tls_cert: String,

    #[serde(default)]
    pub receiver_tls_key: String,

    /// Reject MAIL FROM on sessions that have not upgraded to TLS
    #[serde(default)]
    pub receiver_require_tls: bool,

    /// Maximum inbound message size in KiB
    #[serde(default = "default_max_msg_size")]
    pub receiver_max_msg_size: i64,

    /// Connections per IP per minute, 0 = unlimited
    #[serde(default = "default_rate_limit")]
    pub receiver_rate_limit: i64,

    /// Comma-separated blocked IPs
    #[serde(default)]
    pub receiver_blacklist: String,

    /// Tag inbound mail with a spam heuristic
    #[serde(default)]
    pub receiver_spam_filter: bool,

    /// Run retention cleanup at startup and nightly
    #[serde(default)]
    pub cleanup_enabled: bool,

    #[serde(default = "default_retention_days")]
    pub cleanup_email_log_days: i64,

    #[serde(default = "default_retention_days")]
    pub cleanup_inbox_days: i64,

    #[serde(default = "default_retention_days")]
    pub cleanup_queue_days: i64,

    #[serde(default = "default_retention_days")]
    pub cleanup_forward_days: i64,

    #[serde(default = "default_retention_days")]
    pub cleanup_attach_days: i64,

    /// Secret for session token signing, rotated when weak
    #[serde(default)]
    pub jwt_secret: String,
}

fn default_domain() -> String {
    "example.com".to_string()
}

fn default_dkim_selector() -> String {
    "default".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> String {
    "9901".to_string()
}

fn default_receiver_port() -> String {
    "2525".to_string()
}

fn default_max_msg_size() -> i64 {
    5120
}

fn default_rate_limit() -> i64 {
    60
}

fn default_retention_days() -> i64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            dkim_selector: default_dkim_selector(),
            dkim_private_key: String::new(),
            host: default_host(),
            port: default_port(),
            base_url: String::new(),
            enable_ssl: false,
            cert_file: String::new(),
            key_file: String::new(),
            enable_receiver: false,
            receiver_port: default_receiver_port(),
            receiver_tls: false,
            receiver_tls_cert: String::new(),
            receiver_tls_key: String::new(),
            receiver_require_tls: false,
            receiver_max_msg_size: default_max_msg_size(),
            receiver_rate_limit: default_rate_limit(),
            receiver_blacklist: String::new(),
            receiver_spam_filter: false,
            cleanup_enabled: false,
            cleanup_email_log_days: default_retention_days(),
            cleanup_inbox_days: default_retention_days(),
            cleanup_queue_days: default_retention_days(),
            cleanup_forward_days: default_retention_days(),
            cleanup_attach_days: default_retention_days(),
            jwt_secret: String::new(),
        }
    }
}

impl Config {
    /// Public base URL, falling back to `http://host:port`.
    pub fn effective_base_url(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        if trimmed.is_empty() {
            format!("http://{}:{}", self.host, self.port)
        } else {
            trimmed.to_string()
        }
    }

    /// Maximum inbound message size in bytes.
    pub fn max_msg_bytes(&self) -> usize {
        (self.receiver_max_msg_size.max(0) as usize) * 1024
    }

    /// Blacklisted IPs as a normalized list.
    pub fn blacklist_ips(&self) -> Vec<String> {
        self.receiver_blacklist
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Fill defaults, rotate weak secrets, and generate missing key
    /// material. Returns true when anything changed.
    fn calibrate(&mut self) -> bool {
        let mut changed = false;

        let weak = self.jwt_secret.is_empty()
            || self.jwt_secret.len() < 20
            || WEAK_SECRET_FINGERPRINTS
                .iter()
                .any(|w| self.jwt_secret == *w);
        if weak {
            self.jwt_secret = generate_secret(32);
            changed = true;
        }

        if self.dkim_private_key.is_empty() {
            if let Ok((private_pem, _)) = generate_dkim_keypair() {
                self.dkim_private_key = private_pem;
                changed = true;
            }
        }

        if self.port.is_empty() {
            self.port = default_port();
            changed = true;
        }
        if self.receiver_port.is_empty() {
            self.receiver_port = default_receiver_port();
            changed = true;
        }
        if self.receiver_max_msg_size <= 0 {
            self.receiver_max_msg_size = default_max_msg_size();
            changed = true;
        }
        if self.cleanup_email_log_days <= 0 {
            self.cleanup_email_log_days = default_retention_days();
            changed = true;
        }
        if self.cleanup_inbox_days <= 0 {
            self.cleanup_inbox_days = default_retention_days();
            changed = true;
        }
        if self.cleanup_queue_days <= 0 {
            self.cleanup_queue_days = default_retention_days();
            changed = true;
        }
        if self.cleanup_forward_days <= 0 {
            self.cleanup_forward_days = default_retention_days();
            changed = true;
        }
        if self.cleanup_attach_days <= 0 {
            self.cleanup_attach_days = default_retention_days();
            changed = true;
        }

        changed
    }
}

/// Durable, self-healing configuration store.
///
/// The receiver, worker, and scheduler call [`ConfigStore::snapshot`] on
/// each tick so admin mutations take effect without a restart.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Config>,
}

impl ConfigStore {
    /// Load (or create) the config file at `path`, calibrating it and
    /// writing back any changes.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Config>(&content)
                .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file missing, writing defaults");
                Config::default()
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let changed = config.calibrate();
        let existed = path.exists();
        if changed || !existed {
            write_config(&path, &config)?;
        }

        Ok(Self {
            path,
            inner: RwLock::new(config),
        })
    }

    /// Current config snapshot.
    pub fn snapshot(&self) -> Config {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Apply a mutation and persist the result atomically.
    pub fn update<F>(&self, mutate: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().expect("config lock poisoned");
        mutate(&mut guard);
        guard.calibrate();
        write_config(&self.path, &guard)?;
        Ok(guard.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open-truncate-encode-close with 0600 permissions.
fn write_config(path: &Path, config: &Config) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to encode config: {}", e)))?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|e| Error::Config(format!("Failed to open {}: {}", path.display(), e)))?;
    file.write_all(json.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))?;

    Ok(())
}

/// Random alphanumeric secret with a recognizable prefix.
pub fn generate_secret(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let body: String = (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("mailforge-secret-{}", body)
}

/// Generate an RSA-2048 DKIM keypair as (private PKCS#8 PEM, public SPKI PEM).
pub fn generate_dkim_keypair() -> Result<(String, String)> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| Error::Config(format!("Failed to generate DKIM key: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Config(format!("Failed to encode DKIM private key: {}", e)))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Config(format!("Failed to encode DKIM public key: {}", e)))?;

    Ok((private_pem, public_pem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_nonzero() {
        let config = Config::default();
        assert_eq!(config.port, "9901");
        assert_eq!(config.receiver_port, "2525");
        assert_eq!(config.receiver_max_msg_size, 5120);
        assert_eq!(config.cleanup_inbox_days, 30);
    }

    #[test]
    fn calibrate_rotates_weak_secret() {
        let mut config = Config::default();
        config.jwt_secret = "change-this-secret".to_string();
        assert!(config.calibrate());
        assert!(config.jwt_secret.len() >= 32);
        assert_ne!(config.jwt_secret, "change-this-secret");

        // A healthy secret survives a second calibration untouched.
        let kept = config.jwt_secret.clone();
        config.calibrate();
        assert_eq!(config.jwt_secret, kept);
    }

    #[test]
    fn open_writes_back_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::open(&path).unwrap();
        let first = store.snapshot();
        assert!(!first.jwt_secret.is_empty());
        assert!(!first.dkim_private_key.is_empty());

        let bytes_a = std::fs::read(&path).unwrap();
        drop(store);

        // Re-open: nothing is generative anymore, file must be identical.
        let store = ConfigStore::open(&path).unwrap();
        let bytes_b = std::fs::read(&path).unwrap();
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(store.snapshot().jwt_secret, first.jwt_secret);
    }

    #[test]
    fn update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path).unwrap();

        store
            .update(|c| {
                c.enable_receiver = true;
                c.receiver_rate_limit = 2;
            })
            .unwrap();

        let reloaded = ConfigStore::open(&path).unwrap().snapshot();
        assert!(reloaded.enable_receiver);
        assert_eq!(reloaded.receiver_rate_limit, 2);
    }

    #[test]
    fn effective_base_url_falls_back() {
        let mut config = Config::default();
        config.host = "10.0.0.5".to_string();
        assert_eq!(config.effective_base_url(), "http://10.0.0.5:9901");

        config.base_url = "https://mail.example.com/".to_string();
        assert_eq!(config.effective_base_url(), "https://mail.example.com");
    }
}
