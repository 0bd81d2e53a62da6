//! Tracking hooks: open pixel, click redirect, unsubscribe
//!
//! Public endpoints. All three are idempotent with respect to state
//! already recorded on the email log row.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use mailforge_common::types::ContactStatus;
use mailforge_storage::{CampaignRepository, ContactRepository, EmailLogRepository};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::AppState;

/// 1x1 transparent GIF
const PIXEL_GIF_B64: &str = "R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

fn pixel_response() -> Response {
    let gif = base64::engine::general_purpose::STANDARD
        .decode(PIXEL_GIF_B64)
        .unwrap_or_default();
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        gif,
    )
        .into_response()
}

/// GET /api/v1/track/open/:id — always answers with the pixel, whatever
/// the tracking id resolves to.
pub async fn open(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let logs = EmailLogRepository::new(state.db.pool().clone());

    if let Ok(Some(log)) = logs.find_by_tracking(&id).await {
        match logs.mark_opened(log.id).await {
            // First open only: the campaign counter moves exactly once
            // per delivered message.
            Ok(true) if log.campaign_id > 0 => {
                let campaigns = CampaignRepository::new(state.db.pool().clone());
                if let Err(e) = campaigns.increment_open(log.campaign_id).await {
                    warn!(error = %e, "Failed to increment open count");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to record open"),
        }
    }

    pixel_response()
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub url: String,
}

/// GET /api/v1/track/click/:id?url=<base64url> — count the click, then
/// redirect to the decoded target.
pub async fn click(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ClickQuery>,
) -> Response {
    let target = match URL_SAFE
        .decode(query.url.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(url) => url,
        None => return (StatusCode::BAD_REQUEST, "Invalid URL").into_response(),
    };

    let logs = EmailLogRepository::new(state.db.pool().clone());
    if let Ok(Some(log)) = logs.find_by_tracking(&id).await {
        if let Err(e) = logs.increment_clicked(log.id).await {
            warn!(error = %e, "Failed to increment click count");
        }
        if log.campaign_id > 0 {
            let campaigns = CampaignRepository::new(state.db.pool().clone());
            if let Err(e) = campaigns.increment_click(log.campaign_id).await {
                warn!(error = %e, "Failed to increment campaign clicks");
            }
        }
    }

    debug!(tracking = %id, target = %target, "Click tracked");
    (StatusCode::FOUND, [(header::LOCATION, target)]).into_response()
}

/// GET /api/v1/track/unsubscribe/:id — mark the log, bump the campaign
/// counter once, and unsubscribe the matching contact.
pub async fn unsubscribe(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let logs = EmailLogRepository::new(state.db.pool().clone());

    let log = match logs.find_by_tracking(&id).await {
        Ok(Some(log)) => log,
        _ => return (StatusCode::NOT_FOUND, "Invalid unsubscribe link.").into_response(),
    };

    match logs.mark_unsubscribed(log.id).await {
        Ok(true) => {
            if log.campaign_id > 0 {
                let campaigns = CampaignRepository::new(state.db.pool().clone());
                if let Err(e) = campaigns.increment_unsubscribe(log.campaign_id).await {
                    warn!(error = %e, "Failed to increment unsubscribe count");
                }
            }

            let contacts = ContactRepository::new(state.db.pool().clone());
            if let Err(e) = contacts
                .set_status_by_email(&log.recipient, ContactStatus::Unsubscribed.as_str())
                .await
            {
                warn!(error = %e, "Failed to unsubscribe contact");
            }
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Failed to record unsubscribe"),
    }

    (
        StatusCode::OK,
        "You have been successfully unsubscribed. We're sorry to see you go.",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CaptchaStore;
    use axum::extract::{Path, Query, State};
    use mailforge_common::ConfigStore;
    use mailforge_core::{CampaignEngine, CleanupRunner, DeliveryEngine, QueueManager};
    use mailforge_storage::{
        AttachmentStore, ContactGroupRepository, Database, NewEmailLog,
    };
    use std::sync::Arc;
    use uuid::Uuid;

    async fn test_state() -> AppState {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();

        let config = Arc::new(
            ConfigStore::open(
                std::env::temp_dir().join(format!("mailforge-test-{}.json", Uuid::new_v4())),
            )
            .unwrap(),
        );
        let files = AttachmentStore::new(std::env::temp_dir());
        let engine = Arc::new(DeliveryEngine::new(db.clone(), config.clone(), files.clone()));
        let queue = Arc::new(QueueManager::new(db.clone(), engine));
        let campaigns = Arc::new(CampaignEngine::new(db.clone(), config.clone(), queue.clone()));
        let cleanup = Arc::new(CleanupRunner::new(db.clone(), files.clone()));

        AppState {
            db,
            config,
            files,
            queue,
            campaigns,
            cleanup,
            captcha: Arc::new(CaptchaStore::new()),
        }
    }

    async fn seed_tracked_log(state: &AppState) -> (i64, String) {
        sqlx::query(
            "INSERT INTO campaigns (created_at, updated_at, status, total_count) VALUES (?, ?, 'processing', 1)",
        )
        .bind(chrono::Utc::now())
        .bind(chrono::Utc::now())
        .execute(state.db.pool())
        .await
        .unwrap();

        let tracking_id = Uuid::new_v4().to_string();
        EmailLogRepository::new(state.db.pool().clone())
            .create(&NewEmailLog {
                recipient: "ann@x.test".to_string(),
                status: "success".to_string(),
                channel: "smtp_1".to_string(),
                campaign_id: 1,
                tracking_id: tracking_id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        (1, tracking_id)
    }

    async fn campaign_counters(state: &AppState) -> (i64, i64, i64) {
        sqlx::query_as("SELECT open_count, click_count, unsubscribe_count FROM campaigns WHERE id = 1")
            .fetch_one(state.db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn double_open_counts_once() {
        let state = test_state().await;
        let (_, tracking_id) = seed_tracked_log(&state).await;

        let first = open(State(state.clone()), Path(tracking_id.clone())).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            first.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/gif"
        );

        let second = open(State(state.clone()), Path(tracking_id)).await;
        assert_eq!(second.status(), StatusCode::OK);

        assert_eq!(campaign_counters(&state).await.0, 1);
    }

    #[tokio::test]
    async fn unknown_tracking_id_still_serves_pixel() {
        let state = test_state().await;
        let response = open(State(state), Path("missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn click_redirects_to_decoded_target() {
        let state = test_state().await;
        let (_, tracking_id) = seed_tracked_log(&state).await;

        let encoded = URL_SAFE.encode(b"http://a.test/page?q=1");
        let response = click(
            State(state.clone()),
            Path(tracking_id),
            Query(ClickQuery { url: encoded }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "http://a.test/page?q=1"
        );
        assert_eq!(campaign_counters(&state).await.1, 1);

        let bad = click(
            State(state),
            Path("x".to_string()),
            Query(ClickQuery {
                url: "!!not-base64!!".to_string(),
            }),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsubscribe_flips_contact_and_counts_once() {
        let state = test_state().await;
        let (_, tracking_id) = seed_tracked_log(&state).await;

        // A contact with the recipient address, in some group.
        let group = ContactGroupRepository::new(state.db.pool().clone())
            .create("news", "")
            .await
            .unwrap();
        ContactRepository::new(state.db.pool().clone())
            .create("ann@x.test", "Ann", group.id, "")
            .await
            .unwrap();

        let first = unsubscribe(State(state.clone()), Path(tracking_id.clone())).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = unsubscribe(State(state.clone()), Path(tracking_id)).await;
        assert_eq!(second.status(), StatusCode::OK);

        assert_eq!(campaign_counters(&state).await.2, 1);

        let status: (String,) =
            sqlx::query_as("SELECT status FROM contacts WHERE email = 'ann@x.test'")
                .fetch_one(state.db.pool())
                .await
                .unwrap();
        assert_eq!(status.0, "unsubscribed");

        let missing = unsubscribe(State(state), Path("missing".to_string())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
