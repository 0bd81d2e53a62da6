//! Attachment file repository

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::AttachmentFile;

/// Input for a staged attachment record
#[derive(Debug, Clone, Default)]
pub struct NewAttachmentFile {
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    /// "api_base64", "api_url", or "inbox"
    pub source: String,
    /// Recipient address or `inbox:<id>`
    pub related_to: String,
}

#[derive(Clone)]
pub struct AttachmentRepository {
    pool: SqlitePool,
}

impl AttachmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &NewAttachmentFile) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO attachment_files
                (created_at, updated_at, filename, file_path, file_size,
                 content_type, source, related_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&input.filename)
        .bind(&input.file_path)
        .bind(input.file_size)
        .bind(&input.content_type)
        .bind(&input.source)
        .bind(&input.related_to)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<AttachmentFile>, sqlx::Error> {
        sqlx::query_as::<_, AttachmentFile>(
            "SELECT * FROM attachment_files WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<AttachmentFile>, sqlx::Error> {
        sqlx::query_as::<_, AttachmentFile>(
            r#"
            SELECT * FROM attachment_files WHERE deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    /// Hard delete: the caller must also unlink the disk file.
    pub async fn delete_hard(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM attachment_files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Retention cleanup batch: full rows, so the caller can unlink files.
    pub async fn older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AttachmentFile>, sqlx::Error> {
        sqlx::query_as::<_, AttachmentFile>(
            "SELECT * FROM attachment_files WHERE created_at < ? LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_ids(&self, ids: &[i64]) -> Result<u64, sqlx::Error> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM attachment_files WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Total bytes referenced by live rows.
    pub async fn total_size(&self) -> Result<i64, sqlx::Error> {
        let total: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(file_size) FROM attachment_files WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(total.0.unwrap_or(0))
    }
}
