//! API key repository

use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::ApiKey;

#[derive(Clone)]
pub struct ApiKeyRepository {
    pool: SqlitePool,
}

impl ApiKeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, key: &str, name: &str) -> Result<ApiKey, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys (created_at, updated_at, key, name)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(key)
        .bind(name)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list(&self) -> Result<Vec<ApiKey>, sqlx::Error> {
        sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE deleted_at IS NULL ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, sqlx::Error> {
        sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE key = ? AND deleted_at IS NULL",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn touch_last_used(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE api_keys SET last_used = ?, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE api_keys SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
