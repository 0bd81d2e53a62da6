//! Inbox read API

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_storage::{InboxItem, InboxRepository};
use serde::Deserialize;

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
) -> ApiResult<Json<Vec<InboxItem>>> {
    let repo = InboxRepository::new(state.db.pool().clone());
    Ok(Json(
        repo.list(query.limit.clamp(1, 200), query.offset.max(0))
            .await
            .map_err(db_err)?,
    ))
}

/// GET /api/v1/inbox/:id — reading marks the item as read.
pub async fn get(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<InboxItem>> {
    let repo = InboxRepository::new(state.db.pool().clone());
    let item = repo.get(id).await.map_err(db_err)?.ok_or_else(|| not_found("Inbox item"))?;

    if !item.is_read {
        repo.mark_read(id, true).await.map_err(db_err)?;
    }
    Ok(Json(item))
}

pub async fn mark_unread(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let repo = InboxRepository::new(state.db.pool().clone());
    if repo.mark_read(id, false).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Inbox item"))
    }
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = InboxRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Inbox item"))
    }
}
