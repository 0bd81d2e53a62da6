//! Contact and contact group repositories

use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Contact, ContactGroup};

/// Result of a guarded group deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDelete {
    Deleted,
    NotFound,
    /// Refused: this many live contacts still reference the group.
    StillReferenced(i64),
}

#[derive(Clone)]
pub struct ContactGroupRepository {
    pool: SqlitePool,
}

impl ContactGroupRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str, description: &str) -> Result<ContactGroup, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, ContactGroup>(
            r#"
            INSERT INTO contact_groups (created_at, updated_at, name, description)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<ContactGroup>, sqlx::Error> {
        sqlx::query_as::<_, ContactGroup>(
            "SELECT * FROM contact_groups WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(&self) -> Result<Vec<ContactGroup>, sqlx::Error> {
        sqlx::query_as::<_, ContactGroup>(
            "SELECT * FROM contact_groups WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Live contacts still referencing the group.
    pub async fn contact_count(&self, id: i64) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM contacts WHERE group_id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// Guarded deletion: refused while live contacts still reference the
    /// group, whatever the caller.
    pub async fn delete(&self, id: i64) -> Result<GroupDelete, sqlx::Error> {
        let referenced = self.contact_count(id).await?;
        if referenced > 0 {
            return Ok(GroupDelete::StillReferenced(referenced));
        }

        let result = sqlx::query(
            "UPDATE contact_groups SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            Ok(GroupDelete::Deleted)
        } else {
            Ok(GroupDelete::NotFound)
        }
    }
}

#[derive(Clone)]
pub struct ContactRepository {
    pool: SqlitePool,
}

impl ContactRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        email: &str,
        name: &str,
        group_id: i64,
        meta_data: &str,
    ) -> Result<Contact, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Contact>(
            r#"
            INSERT INTO contacts (created_at, updated_at, email, name, group_id, status, meta_data)
            VALUES (?, ?, ?, ?, ?, 'active', ?)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(email)
        .bind(name)
        .bind(group_id)
        .bind(meta_data)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Contact>, sqlx::Error> {
        sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_by_group(&self, group_id: i64) -> Result<Vec<Contact>, sqlx::Error> {
        sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE group_id = ? AND deleted_at IS NULL ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Campaign expansion source: active contacts only.
    pub async fn list_active_by_group(&self, group_id: i64) -> Result<Vec<Contact>, sqlx::Error> {
        sqlx::query_as::<_, Contact>(
            r#"
            SELECT * FROM contacts
            WHERE group_id = ? AND status = 'active' AND deleted_at IS NULL
            ORDER BY id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn update(
        &self,
        id: i64,
        email: &str,
        name: &str,
        status: &str,
        meta_data: &str,
    ) -> Result<Option<Contact>, sqlx::Error> {
        sqlx::query_as::<_, Contact>(
            r#"
            UPDATE contacts SET email = ?, name = ?, status = ?, meta_data = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(name)
        .bind(status)
        .bind(meta_data)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Flip every contact with this address to the given status
    /// (unsubscribe hook).
    pub async fn set_status_by_email(&self, email: &str, status: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE contacts SET status = ?, updated_at = ? WHERE email = ? AND deleted_at IS NULL",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE contacts SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
