//! Sending domain repository

use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Domain;

#[derive(Clone)]
pub struct DomainRepository {
    pool: SqlitePool,
}

impl DomainRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        dkim_selector: &str,
        dkim_private_key: &str,
        dkim_public_key: &str,
        mail_subdomain_prefix: &str,
    ) -> Result<Domain, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Domain>(
            r#"
            INSERT INTO domains
                (created_at, updated_at, name, dkim_selector, dkim_private_key,
                 dkim_public_key, mail_subdomain_prefix)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(dkim_selector)
        .bind(dkim_private_key)
        .bind(dkim_public_key)
        .bind(mail_subdomain_prefix)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Domain>, sqlx::Error> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Case-insensitive lookup by name (the column collates NOCASE).
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Domain>, sqlx::Error> {
        sqlx::query_as::<_, Domain>(
            "SELECT * FROM domains WHERE name = ? COLLATE NOCASE AND deleted_at IS NULL",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(&self) -> Result<Vec<Domain>, sqlx::Error> {
        sqlx::query_as::<_, Domain>(
            "SELECT * FROM domains WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Refresh cached verification flags (advisory, set by on-demand checks).
    pub async fn update_verification(
        &self,
        id: i64,
        spf: bool,
        dkim: bool,
        dmarc: bool,
        mx: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE domains SET
                spf_verified = ?, dkim_verified = ?, dmarc_verified = ?, mx_verified = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(spf)
        .bind(dkim)
        .bind(dmarc)
        .bind(mx)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE domains SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn name_lookup_ignores_case() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = DomainRepository::new(db.pool().clone());

        repo.create("Mail.Example.ORG", "default", "k", "p", "")
            .await
            .unwrap();

        assert!(repo.find_by_name("mail.example.org").await.unwrap().is_some());
        assert!(repo.find_by_name("MAIL.EXAMPLE.ORG").await.unwrap().is_some());
        assert!(repo.find_by_name("other.org").await.unwrap().is_none());

        // Uniqueness is case-insensitive too.
        assert!(repo
            .create("mail.example.org", "default", "k", "p", "")
            .await
            .is_err());
    }
}
