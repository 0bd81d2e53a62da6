//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Admin user
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub totp_secret: String,
    pub totp_enabled: bool,
}

/// Login session, opaque bearer token resolved against this table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// API access key, opaque bearer string with prefix `sk_live_`
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub key: String,
    pub name: String,
    pub last_used: Option<DateTime<Utc>>,
}

/// Outbound SMTP relay configuration
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub implicit_tls: bool,
    pub is_default: bool,
}

/// Sending domain with its DKIM keypair and cached verification flags
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Domain {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    pub dkim_selector: String,
    #[serde(skip_serializing)]
    pub dkim_private_key: String,
    pub dkim_public_key: String,
    pub mail_subdomain_prefix: String,
    pub spf_verified: bool,
    pub dkim_verified: bool,
    pub dmarc_verified: bool,
    pub mx_verified: bool,
    pub certificate_id: Option<i64>,
}

/// Email template with `{{.var}}` placeholders
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    pub subject: String,
    pub body: String,
}

/// Contact group
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ContactGroup {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    pub description: String,
}

/// Contact. (group_id, email) is unique.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub email: String,
    pub name: String,
    pub group_id: i64,
    pub status: String,
    pub meta_data: String,
}

/// Marketing campaign with counter snapshot
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub channel_id: i64,
    pub target_type: String,
    pub target_group_id: i64,
    pub target_list: String,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub total_count: i64,
    pub sent_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub open_count: i64,
    pub click_count: i64,
    pub unsubscribe_count: i64,
}

/// Persistent send task. `campaign_id` 0 means none; `attachments` holds
/// the JSON-encoded attachment list.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub from_addr: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachments: String,
    pub channel_id: i64,
    pub status: String,
    pub retries: i64,
    pub next_retry: DateTime<Utc>,
    pub error_msg: String,
    pub campaign_id: i64,
    pub tracking_id: String,
}

/// One row per delivery attempt that reached the engine
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: String,
    pub error_msg: String,
    pub channel: String,
    pub campaign_id: i64,
    pub tracking_id: String,
    pub opened: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_count: i64,
    pub unsubscribed: bool,
}

/// Accepted inbound message
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub body: String,
    pub raw_data: String,
    pub is_read: bool,
    pub tags: String,
    pub remote_ip: String,
}

/// Staged attachment file; the row exclusively owns the disk path
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AttachmentFile {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub source: String,
    pub related_to: String,
}

/// Inbound forwarding rule. Resolution precedence: exact > prefix > all.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ForwardRule {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub domain_id: i64,
    pub match_type: String,
    pub match_addr: String,
    pub forward_to: String,
    pub enabled: bool,
    pub remark: String,
}

/// One row per forwarding attempt
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ForwardLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub rule_id: i64,
    pub from_addr: String,
    pub to_addr: String,
    pub forward_to: String,
    pub subject: String,
    pub status: String,
    pub error_msg: String,
    pub remote_ip: String,
}

/// Applied schema migration
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub id: i64,
    pub version: i64,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// Dashboard statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_sent: i64,
    pub today_sent: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_sent_time: Option<DateTime<Utc>>,
    pub trend: Vec<TrendPoint>,
}

/// Hourly trend data point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub time: String,
    pub count: i64,
}
