//! API handlers

pub mod auth;
pub mod campaigns;
pub mod channels;
pub mod contacts;
pub mod domains;
pub mod files;
pub mod inbox;
pub mod keys;
pub mod receiver;
pub mod rules;
pub mod send;
pub mod stats;
pub mod templates;
pub mod tracking;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

/// Error payload returned by every handler
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

/// Build an error response tuple.
pub fn err(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: message.into(),
        }),
    )
}

/// 500 with the database error logged.
pub fn db_err(e: sqlx::Error) -> ApiError {
    tracing::error!(error = %e, "Database error");
    err(
        StatusCode::INTERNAL_SERVER_ERROR,
        "database_error",
        "Database operation failed",
    )
}

/// 404 for a missing resource.
pub fn not_found(what: &str) -> ApiError {
    err(StatusCode::NOT_FOUND, "not_found", format!("{} not found", what))
}
