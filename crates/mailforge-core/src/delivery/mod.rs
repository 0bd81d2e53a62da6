//! Outbound delivery engine
//!
//! Takes a normalized send request, produces a signed RFC 5322 message,
//! and transmits it through a relay channel or by direct MX delivery.
//! Every attempt that reaches the engine leaves one email_logs row.

pub mod direct;
pub mod message;
pub mod relay;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use lettre::address::Envelope;
use mailforge_common::types::extract_domain;
use mailforge_common::ConfigStore;
use mailforge_storage::{
    AttachmentStore, ChannelRepository, Database, DomainRepository, EmailLogRepository,
    NewEmailLog,
};
use message::ResolvedAttachment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::dkim::{DkimSigner, DkimSigningConfig};

/// Remote attachment fetches: response cap and timeout.
const FETCH_LIMIT: usize = 10 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Attachment as submitted by callers: base64 content, a `local://`
/// staging path, or a remote URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub url: String,
}

/// Normalized send request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// 0 = auto (default channel, falling through to direct send)
    #[serde(default)]
    pub channel_id: i64,
    #[serde(default)]
    pub template_id: i64,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub campaign_id: i64,
    #[serde(default)]
    pub tracking_id: String,
}

/// Outbound delivery engine
pub struct DeliveryEngine {
    db: Database,
    config: Arc<ConfigStore>,
    files: AttachmentStore,
    http: reqwest::Client,
}

impl DeliveryEngine {
    pub fn new(db: Database, config: Arc<ConfigStore>, files: AttachmentStore) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            db,
            config,
            files,
            http,
        }
    }

    /// Deliver one message. On any failure an email_logs row with
    /// status=failed is written and the error is returned to the caller
    /// (the queue decides retry vs terminal).
    pub async fn send(&self, req: &SendRequest) -> Result<()> {
        let config = self.config.snapshot();

        let from = if req.from.is_empty() {
            format!("noreply@{}", config.domain)
        } else {
            req.from.clone()
        };

        let attachments = match self.resolve_attachments(&req.attachments).await {
            Ok(attachments) => attachments,
            Err(e) => return self.log_failure(req, e).await,
        };

        let mut raw = message::build_message(&from, &req.to, &req.subject, &req.body, &attachments);

        let envelope = match build_envelope(&from, &req.to) {
            Ok(envelope) => envelope,
            Err(e) => return self.log_failure(req, e).await,
        };

        // DKIM is only meaningful on the direct path; relays sign with
        // their own keys.
        if req.channel_id == 0 {
            if let Some((domain, selector, key)) = self.dkim_key_for(&from, &config).await {
                let signing = DkimSigningConfig::new(domain, selector, key);
                match DkimSigner::new(signing).and_then(|s| s.sign_message(&raw)) {
                    Ok(signed) => raw = signed,
                    // Unsigned mail still delivers; signing failure is not fatal.
                    Err(e) => warn!(error = %e, "DKIM signing failed, sending unsigned"),
                }
            }
        }

        let channels = ChannelRepository::new(self.db.pool().clone());

        if req.channel_id > 0 {
            let channel = match channels.get(req.channel_id).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    return self
                        .log_failure(req, anyhow!("smtp_config_not_found: channel {}", req.channel_id))
                        .await
                }
                Err(e) => return self.log_failure(req, anyhow!("smtp_config_not_found: {}", e)).await,
            };
            return match relay::send_via_channel(&channel, &envelope, &raw).await {
                Ok(()) => self.log_success(req, &format!("smtp_{}", channel.id)).await,
                Err(e) => self.log_failure(req, e).await,
            };
        }

        // Auto routing: default channel first, then fall through to direct.
        if let Ok(Some(default_channel)) = channels.get_default().await {
            match relay::send_via_channel(&default_channel, &envelope, &raw).await {
                Ok(()) => return self.log_success(req, "auto").await,
                Err(e) => {
                    debug!(channel = default_channel.id, error = %e, "Default channel failed, trying direct send");
                }
            }
        }

        let sender_domain = extract_domain(&from).to_string();
        let recipient_domain = extract_domain(&req.to).to_string();
        if recipient_domain.is_empty() {
            return self
                .log_failure(req, anyhow!("invalid_to: {}", req.to))
                .await;
        }

        match direct::send_direct(&sender_domain, &recipient_domain, &envelope, &raw).await {
            Ok(()) => self.log_success(req, "direct").await,
            Err(e) => self.log_failure(req, e).await,
        }
    }

    /// DKIM key source: the domain row when it has a key, else the
    /// process-wide key when the sender domain is the configured domain.
    async fn dkim_key_for(
        &self,
        from: &str,
        config: &mailforge_common::Config,
    ) -> Option<(String, String, String)> {
        let sender_domain = extract_domain(from);
        if sender_domain.is_empty() {
            return None;
        }

        let domains = DomainRepository::new(self.db.pool().clone());
        if let Ok(Some(domain)) = domains.find_by_name(sender_domain).await {
            if !domain.dkim_private_key.is_empty() {
                return Some((
                    sender_domain.to_string(),
                    domain.dkim_selector,
                    domain.dkim_private_key,
                ));
            }
        }

        if sender_domain == config.domain && !config.dkim_private_key.is_empty() {
            return Some((
                sender_domain.to_string(),
                config.dkim_selector.clone(),
                config.dkim_private_key.clone(),
            ));
        }

        None
    }

    /// Resolve attachments to bytes: inline base64, staged local files,
    /// or a remote fetch (SSRF-guarded, capped at 10 MiB). Attachments
    /// with neither content nor URL are skipped.
    async fn resolve_attachments(
        &self,
        attachments: &[Attachment],
    ) -> Result<Vec<ResolvedAttachment>> {
        let mut resolved = Vec::with_capacity(attachments.len());

        for attachment in attachments {
            let data = if !attachment.content.is_empty() {
                BASE64
                    .decode(attachment.content.trim())
                    .map_err(|e| anyhow!("invalid_attachment_base64: {}", e))?
            } else if let Some(local) = attachment.url.strip_prefix("local://") {
                self.files
                    .read(local)
                    .await
                    .map_err(|e| anyhow!("failed_read_local_attachment: {}", e))?
            } else if !attachment.url.is_empty() {
                self.fetch_url(&attachment.url)
                    .await
                    .with_context(|| format!("failed_download_attachment: {}", attachment.url))?
            } else {
                continue;
            };

            resolved.push(ResolvedAttachment {
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
                data,
            });
        }

        Ok(resolved)
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        if crate::ssrf::is_internal_url(url).await {
            return Err(anyhow!("url resolves to an internal address"));
        }

        let mut response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("status {}", response.status()));
        }

        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            data.extend_from_slice(&chunk);
            if data.len() > FETCH_LIMIT {
                return Err(anyhow!("response exceeds {} bytes", FETCH_LIMIT));
            }
        }
        Ok(data)
    }

    async fn log_success(&self, req: &SendRequest, channel: &str) -> Result<()> {
        let logs = EmailLogRepository::new(self.db.pool().clone());
        logs.create(&NewEmailLog {
            recipient: req.to.clone(),
            subject: req.subject.clone(),
            body: req.body.clone(),
            status: "success".to_string(),
            error_msg: String::new(),
            channel: channel.to_string(),
            campaign_id: req.campaign_id,
            tracking_id: req.tracking_id.clone(),
        })
        .await
        .map_err(|e| anyhow!("failed to write email log: {}", e))?;
        Ok(())
    }

    async fn log_failure(&self, req: &SendRequest, error: anyhow::Error) -> Result<()> {
        let channel = if req.channel_id > 0 {
            format!("smtp_{}", req.channel_id)
        } else {
            "auto".to_string()
        };

        let logs = EmailLogRepository::new(self.db.pool().clone());
        if let Err(e) = logs
            .create(&NewEmailLog {
                recipient: req.to.clone(),
                subject: req.subject.clone(),
                body: req.body.clone(),
                status: "failed".to_string(),
                error_msg: format!("{:#}", error),
                channel,
                campaign_id: req.campaign_id,
                tracking_id: req.tracking_id.clone(),
            })
            .await
        {
            warn!(error = %e, "Failed to write email log row");
        }

        Err(error)
    }
}

fn build_envelope(from: &str, to: &str) -> Result<Envelope> {
    let sender = from
        .parse::<lettre::Address>()
        .map_err(|e| anyhow!("invalid_from: {}", e))?;
    let recipient = to
        .parse::<lettre::Address>()
        .map_err(|e| anyhow!("invalid_to: {}", e))?;
    Envelope::new(Some(sender), vec![recipient]).map_err(|e| anyhow!("invalid_envelope: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_rejects_bad_addresses() {
        assert!(build_envelope("not-an-address", "a@x.test").is_err());
        assert!(build_envelope("a@x.test", "also bad").is_err());
        assert!(build_envelope("a@x.test", "b@y.test").is_ok());
    }

    #[test]
    fn send_request_deserializes_with_defaults() {
        let req: SendRequest =
            serde_json::from_str(r#"{"to":"a@x.test","subject":"s","body":"b"}"#).unwrap();
        assert_eq!(req.channel_id, 0);
        assert!(req.from.is_empty());
        assert!(req.attachments.is_empty());
        assert!(req.variables.is_empty());
    }
}
