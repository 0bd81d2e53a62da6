//! Campaign CRUD and lifecycle actions

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_core::campaign::CampaignError;
use mailforge_storage::{Campaign, CampaignInput, CampaignRepository};
use serde::Deserialize;

use crate::auth::AppState;
use crate::handlers::{db_err, err, not_found, ApiError, ApiResult};

fn campaign_err(e: CampaignError) -> ApiError {
    let status = match &e {
        CampaignError::NotFound => StatusCode::NOT_FOUND,
        CampaignError::NotStartable
        | CampaignError::NotProcessing
        | CampaignError::NotPaused
        | CampaignError::EmptyRecipients
        | CampaignError::InvalidChannel => StatusCode::BAD_REQUEST,
        CampaignError::Database(_) | CampaignError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    err(status, "campaign_error", e.to_string())
}

fn validate(input: &CampaignInput) -> Result<(), ApiError> {
    if input.name.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Name is required"));
    }
    if !matches!(input.target_type.as_str(), "group" | "manual") {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "target_type must be group or manual",
        ));
    }
    Ok(())
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Campaign>>> {
    let repo = CampaignRepository::new(state.db.pool().clone());
    Ok(Json(repo.list().await.map_err(db_err)?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Campaign>> {
    let repo = CampaignRepository::new(state.db.pool().clone());
    repo.get(id)
        .await
        .map_err(db_err)?
        .map(Json)
        .ok_or_else(|| not_found("Campaign"))
}

pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CampaignInput>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    validate(&input)?;
    let repo = CampaignRepository::new(state.db.pool().clone());
    let campaign = repo.create(&input).await.map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// PUT /api/v1/campaigns/:id — drafts only.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<CampaignInput>,
) -> ApiResult<Json<Campaign>> {
    validate(&input)?;
    let repo = CampaignRepository::new(state.db.pool().clone());
    repo.update(id, &input)
        .await
        .map_err(db_err)?
        .map(Json)
        .ok_or_else(|| {
            err(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Only draft campaigns can be edited",
            )
        })
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = CampaignRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Campaign"))
    }
}

/// POST /api/v1/campaigns/:id/start
pub async fn start(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Campaign>> {
    state.campaigns.start(id).await.map(Json).map_err(campaign_err)
}

/// POST /api/v1/campaigns/:id/pause
pub async fn pause(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Campaign>> {
    state.campaigns.pause(id).await.map(Json).map_err(campaign_err)
}

/// POST /api/v1/campaigns/:id/resume
pub async fn resume(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Campaign>> {
    state.campaigns.resume(id).await.map(Json).map_err(campaign_err)
}

#[derive(Debug, Deserialize)]
pub struct TestSendRequest {
    pub to: String,
}

/// POST /api/v1/campaigns/:id/test
pub async fn test(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<TestSendRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !input.to.contains('@') {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Invalid address"));
    }
    let queue_id = state
        .campaigns
        .test_send(id, &input.to)
        .await
        .map_err(campaign_err)?;
    Ok(Json(serde_json::json!({ "queue_id": queue_id })))
}
