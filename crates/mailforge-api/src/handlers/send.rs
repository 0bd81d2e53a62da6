//! Send endpoint: template rendering, attachment staging, enqueue

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailforge_core::delivery::SendRequest;
use mailforge_core::ssrf::is_internal_url;
use mailforge_storage::{AttachmentRepository, EmailLogRepository, NewAttachmentFile, TemplateRepository};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

use crate::auth::AppState;
use crate::handlers::{err, ApiResult};

/// Maximum staged attachment size (10 MiB).
const MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub message: String,
    pub queue_id: i64,
}

/// POST /api/v1/send
///
/// Accepts a send request, optionally renders a stored template, stages
/// attachments to disk, and queues the message. 202 on success.
pub async fn send_email(
    State(state): State<AppState>,
    Json(mut input): Json<SendRequest>,
) -> ApiResult<(StatusCode, Json<SendResponse>)> {
    if input.to.is_empty() || !input.to.contains('@') {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Valid recipient address is required",
        ));
    }

    if input.template_id > 0 {
        let templates = TemplateRepository::new(state.db.pool().clone());
        let template = templates
            .get(input.template_id)
            .await
            .map_err(crate::handlers::db_err)?
            .ok_or_else(|| err(StatusCode::BAD_REQUEST, "validation_error", "Template not found"))?;

        if !template.subject.is_empty() {
            input.subject = render_template(&template.subject, &input.variables);
        }
        if !template.body.is_empty() {
            input.body = render_template(&template.body, &input.variables);
        }
    }

    stage_attachments(&state, &mut input).await?;

    let queue_id = state.queue.enqueue(&input).await.map_err(|e| {
        err(
            StatusCode::INTERNAL_SERVER_ERROR,
            "queue_error",
            format!("Failed to queue email: {}", e),
        )
    })?;

    info!(queue_id, to = %input.to, "Email queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(SendResponse {
            message: "Email queued successfully".to_string(),
            queue_id,
        }),
    ))
}

/// GET /api/v1/logs
pub async fn list_logs(State(state): State<AppState>) -> ApiResult<Json<Vec<mailforge_storage::EmailLog>>> {
    let logs = EmailLogRepository::new(state.db.pool().clone());
    Ok(Json(logs.list(100).await.map_err(crate::handlers::db_err)?))
}

/// Substitute `{{.var}}` placeholders. Unknown placeholders are left
/// untouched, so an empty variables map returns the template unchanged.
pub fn render_template(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut result = template.to_string();
    for (key, value) in variables {
        let placeholder = format!("{{{{.{}}}}}", key);
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        result = result.replace(&placeholder, &rendered);
    }
    result
}

/// Decode or download each attachment, persist it under `data/uploads`,
/// record an attachment_files row, and point the request at the staged
/// copy so the queue payload stays small.
async fn stage_attachments(state: &AppState, input: &mut SendRequest) -> ApiResult<()> {
    if input.attachments.is_empty() {
        return Ok(());
    }

    let repo = AttachmentRepository::new(state.db.pool().clone());

    for attachment in &mut input.attachments {
        let (data, source) = if !attachment.content.is_empty() {
            let data = BASE64.decode(attachment.content.trim()).map_err(|e| {
                err(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("Attachment {} has invalid base64: {}", attachment.filename, e),
                )
            })?;
            (data, "api_base64")
        } else if !attachment.url.is_empty() && !attachment.url.starts_with("local://") {
            if is_internal_url(&attachment.url).await {
                return Err(err(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("Attachment URL {} is blocked (internal network)", attachment.url),
                ));
            }
            let data = fetch_attachment(&attachment.url).await.map_err(|e| {
                err(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("Failed to download attachment {}: {}", attachment.filename, e),
                )
            })?;
            (data, "api_url")
        } else {
            continue;
        };

        if data.len() > MAX_ATTACHMENT_SIZE {
            return Err(err(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("Attachment {} exceeds limit (10MB)", attachment.filename),
            ));
        }
        if data.is_empty() {
            continue;
        }

        let path = state
            .files
            .save_upload(&attachment.filename, &data)
            .await
            .map_err(|e| {
                err(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    format!("Failed to stage attachment: {}", e),
                )
            })?;

        repo.create(&NewAttachmentFile {
            filename: attachment.filename.clone(),
            file_path: path.clone(),
            file_size: data.len() as i64,
            content_type: attachment.content_type.clone(),
            source: source.to_string(),
            related_to: input.to.clone(),
        })
        .await
        .map_err(crate::handlers::db_err)?;

        attachment.content = String::new();
        attachment.url = format!("local://{}", path);
    }

    Ok(())
}

async fn fetch_attachment(url: &str) -> anyhow::Result<Vec<u8>> {
    let client = reqwest_client()?;
    let mut response = client.get(url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("status {}", response.status());
    }

    let mut data = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        data.extend_from_slice(&chunk);
        if data.len() > MAX_ATTACHMENT_SIZE {
            anyhow::bail!("response exceeds {} bytes", MAX_ATTACHMENT_SIZE);
        }
    }
    Ok(data)
}

fn reqwest_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_variables_leave_template_unchanged() {
        let vars = HashMap::new();
        assert_eq!(
            render_template("Hello {{.name}}, welcome!", &vars),
            "Hello {{.name}}, welcome!"
        );
    }

    #[test]
    fn variables_substitute_by_type() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), json!("Ann"));
        vars.insert("count".to_string(), json!(3));
        vars.insert("vip".to_string(), json!(true));
        vars.insert("missing".to_string(), json!(null));

        let out = render_template(
            "{{.name}} has {{.count}} items, vip={{.vip}}, x={{.missing}}y, {{.unknown}}",
            &vars,
        );
        assert_eq!(out, "Ann has 3 items, vip=true, x=y, {{.unknown}}");
    }
}
