//! Receiver and retention configuration

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::AppState;
use crate::handlers::{err, ApiResult};

/// Receiver-facing slice of the config; secrets and key material stay
/// server-side.
#[derive(Debug, Serialize)]
pub struct ReceiverConfigResponse {
    pub domain: String,
    pub base_url: String,
    pub enable_receiver: bool,
    pub receiver_port: String,
    pub receiver_tls: bool,
    pub receiver_require_tls: bool,
    pub receiver_max_msg_size: i64,
    pub receiver_rate_limit: i64,
    pub receiver_blacklist: String,
    pub receiver_spam_filter: bool,
    pub cleanup_enabled: bool,
    pub cleanup_email_log_days: i64,
    pub cleanup_inbox_days: i64,
    pub cleanup_queue_days: i64,
    pub cleanup_forward_days: i64,
    pub cleanup_attach_days: i64,
}

/// GET /api/v1/receiver-config
pub async fn get(State(state): State<AppState>) -> Json<ReceiverConfigResponse> {
    let config = state.config.snapshot();
    Json(ReceiverConfigResponse {
        domain: config.domain,
        base_url: config.base_url,
        enable_receiver: config.enable_receiver,
        receiver_port: config.receiver_port,
        receiver_tls: config.receiver_tls,
        receiver_require_tls: config.receiver_require_tls,
        receiver_max_msg_size: config.receiver_max_msg_size,
        receiver_rate_limit: config.receiver_rate_limit,
        receiver_blacklist: config.receiver_blacklist,
        receiver_spam_filter: config.receiver_spam_filter,
        cleanup_enabled: config.cleanup_enabled,
        cleanup_email_log_days: config.cleanup_email_log_days,
        cleanup_inbox_days: config.cleanup_inbox_days,
        cleanup_queue_days: config.cleanup_queue_days,
        cleanup_forward_days: config.cleanup_forward_days,
        cleanup_attach_days: config.cleanup_attach_days,
    })
}

#[derive(Debug, Deserialize)]
pub struct ReceiverConfigUpdate {
    pub domain: Option<String>,
    pub base_url: Option<String>,
    pub enable_receiver: Option<bool>,
    pub receiver_port: Option<String>,
    pub receiver_tls: Option<bool>,
    pub receiver_tls_cert: Option<String>,
    pub receiver_tls_key: Option<String>,
    pub receiver_require_tls: Option<bool>,
    pub receiver_max_msg_size: Option<i64>,
    pub receiver_rate_limit: Option<i64>,
    pub receiver_blacklist: Option<String>,
    pub receiver_spam_filter: Option<bool>,
    pub cleanup_enabled: Option<bool>,
    pub cleanup_email_log_days: Option<i64>,
    pub cleanup_inbox_days: Option<i64>,
    pub cleanup_queue_days: Option<i64>,
    pub cleanup_forward_days: Option<i64>,
    pub cleanup_attach_days: Option<i64>,
}

/// PUT /api/v1/receiver-config — the receiver, worker, and scheduler
/// pick the new values up on their next tick.
pub async fn update(
    State(state): State<AppState>,
    Json(input): Json<ReceiverConfigUpdate>,
) -> ApiResult<Json<ReceiverConfigResponse>> {
    if let Some(port) = &input.receiver_port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Invalid port"));
        }
    }
    if let Some(true) = input.receiver_tls {
        let config = state.config.snapshot();
        let cert = input
            .receiver_tls_cert
            .clone()
            .unwrap_or(config.receiver_tls_cert);
        let cert = if cert.is_empty() { config.cert_file } else { cert };
        if cert.is_empty() {
            return Err(err(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "TLS enabled without a certificate path",
            ));
        }
    }

    state
        .config
        .update(|config| {
            if let Some(v) = input.domain.clone() {
                config.domain = v;
            }
            if let Some(v) = input.base_url.clone() {
                config.base_url = v;
            }
            if let Some(v) = input.enable_receiver {
                config.enable_receiver = v;
            }
            if let Some(v) = input.receiver_port.clone() {
                config.receiver_port = v;
            }
            if let Some(v) = input.receiver_tls {
                config.receiver_tls = v;
            }
            if let Some(v) = input.receiver_tls_cert.clone() {
                config.receiver_tls_cert = v;
            }
            if let Some(v) = input.receiver_tls_key.clone() {
                config.receiver_tls_key = v;
            }
            if let Some(v) = input.receiver_require_tls {
                config.receiver_require_tls = v;
            }
            if let Some(v) = input.receiver_max_msg_size {
                config.receiver_max_msg_size = v;
            }
            if let Some(v) = input.receiver_rate_limit {
                config.receiver_rate_limit = v;
            }
            if let Some(v) = input.receiver_blacklist.clone() {
                config.receiver_blacklist = v;
            }
            if let Some(v) = input.receiver_spam_filter {
                config.receiver_spam_filter = v;
            }
            if let Some(v) = input.cleanup_enabled {
                config.cleanup_enabled = v;
            }
            if let Some(v) = input.cleanup_email_log_days {
                config.cleanup_email_log_days = v;
            }
            if let Some(v) = input.cleanup_inbox_days {
                config.cleanup_inbox_days = v;
            }
            if let Some(v) = input.cleanup_queue_days {
                config.cleanup_queue_days = v;
            }
            if let Some(v) = input.cleanup_forward_days {
                config.cleanup_forward_days = v;
            }
            if let Some(v) = input.cleanup_attach_days {
                config.cleanup_attach_days = v;
            }
        })
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, "config_error", e.to_string()))?;

    info!("Receiver configuration updated");
    Ok(get(State(state)).await)
}
