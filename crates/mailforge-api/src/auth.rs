//! Authentication: session tokens, API keys, and the captcha store

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use mailforge_common::ConfigStore;
use mailforge_core::{CampaignEngine, CleanupRunner, DeliveryEngine, QueueManager};
use mailforge_storage::{
    ApiKeyRepository, AttachmentStore, Database, SessionRepository,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Paths reachable with an `sk_live_` bearer key. Everything else
/// requires an interactive session.
const API_KEY_PATHS: &[&str] = &["/api/v1/send", "/api/v1/stats", "/api/v1/files"];

/// Captcha lifetime.
const CAPTCHA_TTL: Duration = Duration::from_secs(5 * 60);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<ConfigStore>,
    pub files: AttachmentStore,
    pub queue: Arc<QueueManager<DeliveryEngine>>,
    pub campaigns: Arc<CampaignEngine<DeliveryEngine>>,
    pub cleanup: Arc<CleanupRunner>,
    pub captcha: Arc<CaptchaStore>,
}

/// Authenticated principal stored in request extensions
#[derive(Debug, Clone)]
pub enum AuthPrincipal {
    /// Interactive session for a user id
    Session { user_id: i64 },
    /// Bearer API key
    ApiKey { key_id: i64 },
}

/// One-shot captcha store with expiry
pub struct CaptchaStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl CaptchaStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Create a captcha and return (id, code).
    pub async fn create(&self) -> (String, String) {
        let id = Uuid::new_v4().to_string();
        let code: String = {
            let mut rng = rand::thread_rng();
            (0..4)
                .map(|_| {
                    const DIGITS: &[u8] = b"0123456789";
                    DIGITS[rng.gen_range(0..DIGITS.len())] as char
                })
                .collect()
        };

        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, created)| created.elapsed() < CAPTCHA_TTL);
        entries.insert(id.clone(), (code.clone(), Instant::now()));
        (id, code)
    }

    /// Verify and consume a captcha. Expired or unknown ids fail.
    pub async fn verify(&self, id: &str, code: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.remove(id) {
            Some((expected, created)) => {
                created.elapsed() < CAPTCHA_TTL && expected.eq_ignore_ascii_case(code)
            }
            None => false,
        }
    }
}

impl Default for CaptchaStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Random opaque session token.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Random API key with the well-known prefix.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    format!("sk_live_{}", hex::encode(bytes))
}

fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// Authentication middleware: resolves a session token or an API key and
/// stores the principal in request extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer(&request).ok_or(StatusCode::UNAUTHORIZED)?;
    let path = request.uri().path().to_string();

    if token.starts_with("sk_live_") {
        let repo = ApiKeyRepository::new(state.db.pool().clone());
        let key = repo
            .find_by_key(&token)
            .await
            .map_err(|e| {
                warn!(error = %e, "API key lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        if !API_KEY_PATHS.iter().any(|prefix| path.starts_with(prefix)) {
            warn!(key = key.id, path = %path, "API key used outside its allowed paths");
            return Err(StatusCode::FORBIDDEN);
        }

        // Best-effort usage stamp; auth never fails on it.
        let repo_clone = repo.clone();
        let key_id = key.id;
        tokio::spawn(async move {
            let _ = repo_clone.touch_last_used(key_id).await;
        });

        debug!(key = key.id, "API key authenticated");
        request
            .extensions_mut()
            .insert(AuthPrincipal::ApiKey { key_id: key.id });
        return Ok(next.run(request).await);
    }

    let sessions = SessionRepository::new(state.db.pool().clone());
    let session = sessions
        .find_valid(&token)
        .await
        .map_err(|e| {
            warn!(error = %e, "Session lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    request.extensions_mut().insert(AuthPrincipal::Session {
        user_id: session.user_id,
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captcha_is_one_shot() {
        let store = CaptchaStore::new();
        let (id, code) = store.create().await;

        assert!(store.verify(&id, &code).await);
        // Consumed: the same id never verifies twice.
        assert!(!store.verify(&id, &code).await);
    }

    #[tokio::test]
    async fn wrong_code_fails() {
        let store = CaptchaStore::new();
        let (id, _code) = store.create().await;
        assert!(!store.verify(&id, "nope").await);
    }

    #[test]
    fn generated_keys_have_prefix() {
        let key = generate_api_key();
        assert!(key.starts_with("sk_live_"));
        assert!(key.len() > 40);

        let token = generate_session_token();
        assert_eq!(token.len(), 64);
    }
}
