//! Login, captcha, and password handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use mailforge_storage::db::{hash_password, verify_password};
use mailforge_storage::{SessionRepository, UserRepository};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{generate_session_token, AppState, AuthPrincipal};
use crate::handlers::{err, ApiResult};

const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub captcha_id: String,
    pub captcha_code: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

/// POST /api/v1/login
pub async fn login(
    State(state): State<AppState>,
    Json(input): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if !state.captcha.verify(&input.captcha_id, &input.captcha_code).await {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "bad_captcha",
            "Captcha invalid or expired",
        ));
    }

    let users = UserRepository::new(state.db.pool().clone());
    let user = users
        .find_by_username(&input.username)
        .await
        .map_err(crate::handlers::db_err)?;

    let user = match user {
        Some(user) if verify_password(&input.password, &user.password_hash) => user,
        _ => {
            warn!(username = %input.username, "Login failed");
            return Err(err(
                StatusCode::UNAUTHORIZED,
                "bad_credentials",
                "Invalid username or password",
            ));
        }
    };

    let token = generate_session_token();
    let sessions = SessionRepository::new(state.db.pool().clone());
    sessions
        .create(&token, user.id, Utc::now() + Duration::hours(SESSION_TTL_HOURS))
        .await
        .map_err(crate::handlers::db_err)?;

    // Opportunistic housekeeping.
    let _ = sessions.delete_expired().await;

    info!(username = %input.username, "Login succeeded");
    Ok(Json(LoginResponse { token }))
}

#[derive(Debug, Serialize)]
pub struct CaptchaResponse {
    pub captcha_id: String,
    /// SVG data URL for direct embedding
    pub data: String,
}

/// GET /api/v1/captcha
pub async fn get_captcha(State(state): State<AppState>) -> Json<CaptchaResponse> {
    let (captcha_id, code) = state.captcha.create().await;

    let svg = format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="120" height="40">"#,
            r##"<rect width="120" height="40" fill="#f0f0f0"/>"##,
            r#"<text x="60" y="27" font-size="22" text-anchor="middle" "#,
            r#"font-family="monospace" letter-spacing="6">{}</text></svg>"#
        ),
        code
    );

    Json(CaptchaResponse {
        captcha_id,
        data: format!("data:image/svg+xml;base64,{}", BASE64.encode(svg.as_bytes())),
    })
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// POST /api/v1/password
pub async fn change_password(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(input): Json<ChangePasswordRequest>,
) -> ApiResult<StatusCode> {
    let user_id = match principal {
        AuthPrincipal::Session { user_id } => user_id,
        AuthPrincipal::ApiKey { .. } => {
            return Err(err(
                StatusCode::FORBIDDEN,
                "forbidden",
                "Password changes require an interactive session",
            ))
        }
    };

    if input.new_password.len() < 8 {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "New password must be at least 8 characters",
        ));
    }

    let users = UserRepository::new(state.db.pool().clone());
    let user = users
        .get(user_id)
        .await
        .map_err(crate::handlers::db_err)?
        .ok_or_else(|| crate::handlers::not_found("User"))?;

    if !verify_password(&input.old_password, &user.password_hash) {
        return Err(err(
            StatusCode::UNAUTHORIZED,
            "bad_credentials",
            "Old password is incorrect",
        ));
    }

    let hash = hash_password(&input.new_password)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()))?;
    users
        .update_password(user.id, &hash)
        .await
        .map_err(crate::handlers::db_err)?;

    info!(user = user.id, "Password changed");
    Ok(StatusCode::NO_CONTENT)
}
