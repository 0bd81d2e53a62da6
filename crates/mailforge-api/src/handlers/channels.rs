//! Outbound channel CRUD

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_storage::{Channel, ChannelInput, ChannelRepository};

use crate::auth::AppState;
use crate::handlers::{db_err, err, not_found, ApiResult};

fn validate(input: &ChannelInput) -> Result<(), crate::handlers::ApiError> {
    if input.host.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Host is required"));
    }
    if input.port < 1 || input.port > 65535 {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Invalid port"));
    }
    Ok(())
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Channel>>> {
    let repo = ChannelRepository::new(state.db.pool().clone());
    Ok(Json(repo.list().await.map_err(db_err)?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<ChannelInput>,
) -> ApiResult<(StatusCode, Json<Channel>)> {
    validate(&input)?;
    let repo = ChannelRepository::new(state.db.pool().clone());
    let channel = repo.create(&input).await.map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<ChannelInput>,
) -> ApiResult<Json<Channel>> {
    validate(&input)?;
    let repo = ChannelRepository::new(state.db.pool().clone());
    repo.update(id, &input)
        .await
        .map_err(db_err)?
        .map(Json)
        .ok_or_else(|| not_found("Channel"))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = ChannelRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Channel"))
    }
}
