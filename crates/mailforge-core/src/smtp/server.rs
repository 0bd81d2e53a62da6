//! SMTP ingress server

use anyhow::Result;
use mailforge_common::ConfigStore;
use mailforge_storage::{AttachmentStore, Database};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::queue::{Deliverer, QueueManager};
use crate::smtp::rate_limit::RateLimiter;
use crate::smtp::session::SmtpSession;
use crate::smtp::tls::{create_tls_acceptor, receiver_cert_paths};

/// Absolute per-connection deadline.
const SESSION_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// SMTP ingress server. Config is re-read per accepted connection so
/// admin changes to limits, blacklist, and TLS apply without a restart.
pub struct SmtpIngress<D: Deliverer> {
    db: Database,
    config: Arc<ConfigStore>,
    files: AttachmentStore,
    queue: Arc<QueueManager<D>>,
    limiter: Arc<RateLimiter>,
    tls_cache: std::sync::Mutex<Option<(PathBuf, PathBuf, TlsAcceptor)>>,
}

impl<D: Deliverer + 'static> SmtpIngress<D> {
    pub fn new(
        db: Database,
        config: Arc<ConfigStore>,
        files: AttachmentStore,
        queue: Arc<QueueManager<D>>,
    ) -> Self {
        Self {
            db,
            config,
            files,
            queue,
            limiter: Arc::new(RateLimiter::new()),
            tls_cache: std::sync::Mutex::new(None),
        }
    }

    /// Run the listener. Returns early only when binding fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let config = self.config.snapshot();
        if !config.enable_receiver {
            info!("SMTP receiver disabled, skipping");
            return Ok(());
        }

        let addr = format!("0.0.0.0:{}", config.receiver_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            addr = %addr,
            rate_limit = config.receiver_rate_limit,
            "SMTP receiver started"
        );

        // Window housekeeping.
        {
            let limiter = self.limiter.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    limiter.prune().await;
                }
            });
        }

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                let remote_ip = peer_addr.ip().to_string();
                if let Err(e) = server.handle_connection(stream, remote_ip.clone()).await {
                    warn!(ip = %remote_ip, error = %e, "SMTP session error");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        mut stream: tokio::net::TcpStream,
        remote_ip: String,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let config = self.config.snapshot();

        if config.blacklist_ips().iter().any(|ip| ip == &remote_ip) {
            warn!(ip = %remote_ip, "Blocked blacklisted IP");
            stream.write_all(b"554 Your IP is blocked\r\n").await?;
            return Ok(());
        }

        if !self
            .limiter
            .allow(&remote_ip, config.receiver_rate_limit)
            .await
        {
            warn!(ip = %remote_ip, "Rate limit exceeded");
            stream
                .write_all(b"421 Too many connections, try again later\r\n")
                .await?;
            return Ok(());
        }

        let acceptor = self.tls_acceptor(&config);
        let session = SmtpSession::new(
            config,
            self.db.clone(),
            self.files.clone(),
            self.queue.clone(),
            acceptor,
            remote_ip.clone(),
        );

        match timeout(SESSION_DEADLINE, session.run(stream)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(ip = %remote_ip, "Session deadline exceeded, closing");
                Ok(())
            }
        }
    }

    /// STARTTLS acceptor, rebuilt when the configured cert paths change.
    fn tls_acceptor(&self, config: &mailforge_common::Config) -> Option<TlsAcceptor> {
        let (cert_path, key_path) = receiver_cert_paths(config)?;

        let mut cache = self.tls_cache.lock().expect("tls cache lock poisoned");
        if let Some((cached_cert, cached_key, acceptor)) = cache.as_ref() {
            if cached_cert == &cert_path && cached_key == &key_path {
                return Some(acceptor.clone());
            }
        }

        match create_tls_acceptor(&cert_path, &key_path) {
            Ok(acceptor) => {
                *cache = Some((cert_path, key_path, acceptor.clone()));
                Some(acceptor)
            }
            Err(e) => {
                warn!(error = %e, "Failed to load receiver TLS certificate");
                None
            }
        }
    }
}
