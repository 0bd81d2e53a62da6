//! API key management

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_storage::{ApiKey, ApiKeyRepository};
use serde::Deserialize;

use crate::auth::{generate_api_key, AppState};
use crate::handlers::{db_err, err, not_found, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<ApiKey>>> {
    let repo = ApiKeyRepository::new(state.db.pool().clone());
    Ok(Json(repo.list().await.map_err(db_err)?))
}

/// POST /api/v1/keys — the full key is only returned at creation time.
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateKeyRequest>,
) -> ApiResult<(StatusCode, Json<ApiKey>)> {
    if input.name.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Name is required"));
    }

    let key = generate_api_key();
    let repo = ApiKeyRepository::new(state.db.pool().clone());
    let created = repo.create(&key, &input.name).await.map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = ApiKeyRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("API key"))
    }
}
