//! Attachment file management

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_storage::{AttachmentFile, AttachmentRepository};
use serde::Deserialize;
use tracing::warn;

use crate::auth::AppState;
use crate::handlers::{db_err, not_found, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<AttachmentFile>>> {
    let repo = AttachmentRepository::new(state.db.pool().clone());
    Ok(Json(
        repo.list(query.limit.clamp(1, 200), query.offset.max(0))
            .await
            .map_err(db_err)?,
    ))
}

/// DELETE /api/v1/files/:id — removes the row and unlinks the file; the
/// row exclusively owns the disk path.
pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = AttachmentRepository::new(state.db.pool().clone());
    let file = repo.get(id).await.map_err(db_err)?.ok_or_else(|| not_found("File"))?;

    if let Err(e) = state.files.remove(&file.file_path).await {
        warn!(path = %file.file_path, error = %e, "Failed to unlink attachment file");
    }
    repo.delete_hard(id).await.map_err(db_err)?;

    Ok(StatusCode::NO_CONTENT)
}
