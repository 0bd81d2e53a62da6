//! Forward rule CRUD and forward log listing

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_storage::{
    DomainRepository, ForwardLog, ForwardLogRepository, ForwardRule, ForwardRuleInput,
    ForwardRuleRepository,
};

use crate::auth::AppState;
use crate::handlers::{db_err, err, not_found, ApiError, ApiResult};

async fn validate(state: &AppState, input: &ForwardRuleInput) -> Result<(), ApiError> {
    if !matches!(input.match_type.as_str(), "all" | "prefix" | "exact") {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "match_type must be all, prefix, or exact",
        ));
    }
    if input.match_type != "all" && input.match_addr.is_empty() {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "match_addr is required for prefix and exact rules",
        ));
    }
    if !input.forward_to.contains('@') {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "forward_to must be a valid address",
        ));
    }

    let domains = DomainRepository::new(state.db.pool().clone());
    if domains.get(input.domain_id).await.map_err(db_err)?.is_none() {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Domain not found"));
    }
    Ok(())
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<ForwardRule>>> {
    let repo = ForwardRuleRepository::new(state.db.pool().clone());
    Ok(Json(repo.list().await.map_err(db_err)?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<ForwardRuleInput>,
) -> ApiResult<(StatusCode, Json<ForwardRule>)> {
    validate(&state, &input).await?;
    let repo = ForwardRuleRepository::new(state.db.pool().clone());
    let rule = repo.create(&input).await.map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<ForwardRuleInput>,
) -> ApiResult<Json<ForwardRule>> {
    validate(&state, &input).await?;
    let repo = ForwardRuleRepository::new(state.db.pool().clone());
    repo.update(id, &input)
        .await
        .map_err(db_err)?
        .map(Json)
        .ok_or_else(|| not_found("Rule"))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = ForwardRuleRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Rule"))
    }
}

/// GET /api/v1/forward-logs
pub async fn list_logs(State(state): State<AppState>) -> ApiResult<Json<Vec<ForwardLog>>> {
    let repo = ForwardLogRepository::new(state.db.pool().clone());
    Ok(Json(repo.list(100).await.map_err(db_err)?))
}
