//! Template CRUD

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_storage::{Template, TemplateRepository};
use serde::Deserialize;

use crate::auth::AppState;
use crate::handlers::{db_err, err, not_found, ApiResult};

#[derive(Debug, Deserialize)]
pub struct TemplateInput {
    pub name: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Template>>> {
    let repo = TemplateRepository::new(state.db.pool().clone());
    Ok(Json(repo.list().await.map_err(db_err)?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<TemplateInput>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    if input.name.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Name is required"));
    }
    let repo = TemplateRepository::new(state.db.pool().clone());
    let template = repo
        .create(&input.name, &input.subject, &input.body)
        .await
        .map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<TemplateInput>,
) -> ApiResult<Json<Template>> {
    let repo = TemplateRepository::new(state.db.pool().clone());
    repo.update(id, &input.name, &input.subject, &input.body)
        .await
        .map_err(db_err)?
        .map(Json)
        .ok_or_else(|| not_found("Template"))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = TemplateRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Template"))
    }
}
