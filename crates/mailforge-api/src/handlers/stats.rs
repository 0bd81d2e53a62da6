//! Dashboard statistics and maintenance actions

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use mailforge_core::cleanup::CleanupResult;
use mailforge_storage::{AttachmentRepository, EmailLogRepository, QueueRepository, Stats};
use serde::Serialize;

use crate::auth::AppState;
use crate::handlers::{db_err, err, ApiResult};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: Stats,
    pub queue: QueueCounts,
    pub attachment_bytes: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let logs = EmailLogRepository::new(state.db.pool().clone());
    let stats = logs.stats().await.map_err(db_err)?;

    let queue_repo = QueueRepository::new(state.db.pool().clone());
    let mut queue = QueueCounts::default();
    for (status, count) in queue_repo.status_counts().await.map_err(db_err)? {
        match status.as_str() {
            "pending" => queue.pending = count,
            "processing" => queue.processing = count,
            "completed" => queue.completed = count,
            "failed" => queue.failed = count,
            "dead" => queue.dead = count,
            _ => {}
        }
    }

    let attachments = AttachmentRepository::new(state.db.pool().clone());
    let attachment_bytes = attachments.total_size().await.map_err(db_err)?;

    Ok(Json(StatsResponse {
        stats,
        queue,
        attachment_bytes,
    }))
}

/// POST /api/v1/cleanup — run retention cleanup now. 409 while a pass is
/// already in flight.
pub async fn run_cleanup(State(state): State<AppState>) -> ApiResult<Json<CleanupResult>> {
    let config = state.config.snapshot();
    match state.cleanup.run(&config).await {
        Some(result) => Ok(Json(result)),
        None => Err(err(
            StatusCode::CONFLICT,
            "conflict",
            "Cleanup is already running",
        )),
    }
}
