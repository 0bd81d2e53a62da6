//! Contact and contact group handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_common::types::ContactStatus;
use mailforge_storage::{
    Contact, ContactGroup, ContactGroupRepository, ContactRepository, GroupDelete,
};
use serde::{Deserialize, Serialize};

use crate::auth::AppState;
use crate::handlers::{db_err, err, not_found, ApiResult};

#[derive(Debug, Deserialize)]
pub struct GroupInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Group with its live contact count
#[derive(Debug, Serialize)]
pub struct GroupWithCount {
    #[serde(flatten)]
    pub group: ContactGroup,
    pub count: i64,
}

pub async fn list_groups(State(state): State<AppState>) -> ApiResult<Json<Vec<GroupWithCount>>> {
    let repo = ContactGroupRepository::new(state.db.pool().clone());
    let groups = repo.list().await.map_err(db_err)?;

    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let count = repo.contact_count(group.id).await.map_err(db_err)?;
        out.push(GroupWithCount { group, count });
    }
    Ok(Json(out))
}

pub async fn create_group(
    State(state): State<AppState>,
    Json(input): Json<GroupInput>,
) -> ApiResult<(StatusCode, Json<ContactGroup>)> {
    if input.name.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Name is required"));
    }
    let repo = ContactGroupRepository::new(state.db.pool().clone());
    let group = repo
        .create(&input.name, &input.description)
        .await
        .map_err(db_err)?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// DELETE /api/v1/groups/:id — the repository refuses the delete while
/// contacts still reference the group.
pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let repo = ContactGroupRepository::new(state.db.pool().clone());
    match repo.delete(id).await.map_err(db_err)? {
        GroupDelete::Deleted => Ok(StatusCode::NO_CONTENT),
        GroupDelete::NotFound => Err(not_found("Group")),
        GroupDelete::StillReferenced(count) => Err(err(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("Group still has {} contacts", count),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct ContactInput {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub group_id: i64,
    #[serde(default)]
    pub meta_data: String,
}

#[derive(Debug, Deserialize)]
pub struct ContactListQuery {
    pub group_id: i64,
}

pub async fn list_contacts(
    State(state): State<AppState>,
    Query(query): Query<ContactListQuery>,
) -> ApiResult<Json<Vec<Contact>>> {
    let repo = ContactRepository::new(state.db.pool().clone());
    Ok(Json(
        repo.list_by_group(query.group_id).await.map_err(db_err)?,
    ))
}

pub async fn create_contact(
    State(state): State<AppState>,
    Json(input): Json<ContactInput>,
) -> ApiResult<(StatusCode, Json<Contact>)> {
    if !input.email.contains('@') {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Invalid email address"));
    }

    let groups = ContactGroupRepository::new(state.db.pool().clone());
    if groups.get(input.group_id).await.map_err(db_err)?.is_none() {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Group not found"));
    }

    let repo = ContactRepository::new(state.db.pool().clone());
    let contact = repo
        .create(&input.email, &input.name, input.group_id, &input.meta_data)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => err(
                StatusCode::CONFLICT,
                "conflict",
                "Contact already exists in this group",
            ),
            other => db_err(other),
        })?;
    Ok((StatusCode::CREATED, Json(contact)))
}

#[derive(Debug, Deserialize)]
pub struct ContactUpdate {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub meta_data: String,
}

fn default_status() -> String {
    "active".to_string()
}

pub async fn update_contact(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<ContactUpdate>,
) -> ApiResult<Json<Contact>> {
    let valid_status = [
        ContactStatus::Active,
        ContactStatus::Unsubscribed,
        ContactStatus::Bounced,
    ]
    .iter()
    .any(|s| s.as_str() == input.status);
    if !valid_status {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Invalid status"));
    }

    let repo = ContactRepository::new(state.db.pool().clone());
    repo.update(id, &input.email, &input.name, &input.status, &input.meta_data)
        .await
        .map_err(db_err)?
        .map(Json)
        .ok_or_else(|| not_found("Contact"))
}

pub async fn delete_contact(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let repo = ContactRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Contact"))
    }
}
