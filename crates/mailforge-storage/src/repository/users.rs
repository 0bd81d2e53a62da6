//! User and session repositories

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Session, User};

/// User repository
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE username = ? AND deleted_at IS NULL",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn update_password(&self, id: i64, password_hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear TOTP enrollment (CLI `-reset-totp`).
    pub async fn reset_totp(&self, username: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET totp_secret = '', totp_enabled = 0, updated_at = ? WHERE username = ?",
        )
        .bind(Utc::now())
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Session repository
#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        token: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sessions (created_at, token, user_id, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Utc::now())
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve an unexpired session token.
    pub async fn find_valid(&self, token: &str) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE token = ? AND expires_at > ?",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration;

    #[tokio::test]
    async fn session_expiry_is_enforced() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create("live-token", 1, Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        repo.create("stale-token", 1, Utc::now() - Duration::hours(1))
            .await
            .unwrap();

        assert!(repo.find_valid("live-token").await.unwrap().is_some());
        assert!(repo.find_valid("stale-token").await.unwrap().is_none());

        assert_eq!(repo.delete_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_totp_clears_fields() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = UserRepository::new(db.pool().clone());

        sqlx::query("UPDATE users SET totp_secret = 'abc', totp_enabled = 1 WHERE username = 'admin'")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(repo.reset_totp("admin").await.unwrap());
        let admin = repo.find_by_username("admin").await.unwrap().unwrap();
        assert!(!admin.totp_enabled);
        assert!(admin.totp_secret.is_empty());
    }
}
