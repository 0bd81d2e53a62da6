//! Inbox repository

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::InboxItem;

/// Input for an accepted inbound message
#[derive(Debug, Clone, Default)]
pub struct NewInboxItem {
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub body: String,
    pub raw_data: String,
    /// JSON tag list, e.g. `["spam"]`; empty for none
    pub tags: String,
    pub remote_ip: String,
}

#[derive(Clone)]
pub struct InboxRepository {
    pool: SqlitePool,
}

impl InboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, item: &NewInboxItem) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO inbox
                (created_at, updated_at, from_addr, to_addr, subject, body,
                 raw_data, tags, remote_ip)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&item.from_addr)
        .bind(&item.to_addr)
        .bind(&item.subject)
        .bind(&item.body)
        .bind(&item.raw_data)
        .bind(&item.tags)
        .bind(&item.remote_ip)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<InboxItem>, sqlx::Error> {
        sqlx::query_as::<_, InboxItem>("SELECT * FROM inbox WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<InboxItem>, sqlx::Error> {
        sqlx::query_as::<_, InboxItem>(
            r#"
            SELECT * FROM inbox WHERE deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn mark_read(&self, id: i64, read: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE inbox SET is_read = ?, updated_at = ? WHERE id = ?")
            .bind(read)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE inbox SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn old_ids(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM inbox WHERE created_at < ? LIMIT ?")
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn delete_ids(&self, ids: &[i64]) -> Result<u64, sqlx::Error> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM inbox WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
