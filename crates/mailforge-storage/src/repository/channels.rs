//! Outbound channel repository

use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Channel;

/// Channel create/update input
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChannelInput {
    pub name: String,
    pub host: String,
    pub port: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub implicit_tls: bool,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Clone)]
pub struct ChannelRepository {
    pool: SqlitePool,
}

impl ChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &ChannelInput) -> Result<Channel, sqlx::Error> {
        if input.is_default {
            self.clear_default().await?;
        }
        let now = Utc::now();
        sqlx::query_as::<_, Channel>(
            r#"
            INSERT INTO channels
                (created_at, updated_at, name, host, port, username, password, implicit_tls, is_default)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&input.name)
        .bind(&input.host)
        .bind(input.port)
        .bind(&input.username)
        .bind(&input.password)
        .bind(input.implicit_tls)
        .bind(input.is_default)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn update(&self, id: i64, input: &ChannelInput) -> Result<Option<Channel>, sqlx::Error> {
        if input.is_default {
            self.clear_default().await?;
        }
        sqlx::query_as::<_, Channel>(
            r#"
            UPDATE channels SET
                name = ?, host = ?, port = ?, username = ?, password = ?,
                implicit_tls = ?, is_default = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(&input.name)
        .bind(&input.host)
        .bind(input.port)
        .bind(&input.username)
        .bind(&input.password)
        .bind(input.implicit_tls)
        .bind(input.is_default)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Channel>, sqlx::Error> {
        sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(&self) -> Result<Vec<Channel>, sqlx::Error> {
        sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// The channel tried first when a send request asks for auto routing.
    pub async fn get_default(&self) -> Result<Option<Channel>, sqlx::Error> {
        sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE is_default = 1 AND deleted_at IS NULL LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE channels SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_default(&self) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE channels SET is_default = 0 WHERE is_default = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn input(name: &str, default: bool) -> ChannelInput {
        ChannelInput {
            name: name.to_string(),
            host: "smtp.test".to_string(),
            port: 587,
            username: "u".to_string(),
            password: "p".to_string(),
            implicit_tls: false,
            is_default: default,
        }
    }

    #[tokio::test]
    async fn at_most_one_default() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = ChannelRepository::new(db.pool().clone());

        let a = repo.create(&input("a", true)).await.unwrap();
        let b = repo.create(&input("b", true)).await.unwrap();

        let defaults: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM channels WHERE is_default = 1")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(defaults.0, 1);
        assert_eq!(repo.get_default().await.unwrap().unwrap().id, b.id);
        assert!(!repo.get(a.id).await.unwrap().unwrap().is_default);
    }
}
