//! Forward rule and forward log repositories

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{ForwardLog, ForwardRule};

/// Forward rule create/update input
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ForwardRuleInput {
    pub domain_id: i64,
    pub match_type: String,
    #[serde(default)]
    pub match_addr: String,
    pub forward_to: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub remark: String,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone)]
pub struct ForwardRuleRepository {
    pool: SqlitePool,
}

impl ForwardRuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &ForwardRuleInput) -> Result<ForwardRule, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, ForwardRule>(
            r#"
            INSERT INTO forward_rules
                (created_at, updated_at, domain_id, match_type, match_addr,
                 forward_to, enabled, remark)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(input.domain_id)
        .bind(&input.match_type)
        .bind(&input.match_addr)
        .bind(&input.forward_to)
        .bind(input.enabled)
        .bind(&input.remark)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn update(&self, id: i64, input: &ForwardRuleInput) -> Result<Option<ForwardRule>, sqlx::Error> {
        sqlx::query_as::<_, ForwardRule>(
            r#"
            UPDATE forward_rules SET
                domain_id = ?, match_type = ?, match_addr = ?, forward_to = ?,
                enabled = ?, remark = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(input.domain_id)
        .bind(&input.match_type)
        .bind(&input.match_addr)
        .bind(&input.forward_to)
        .bind(input.enabled)
        .bind(&input.remark)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(&self) -> Result<Vec<ForwardRule>, sqlx::Error> {
        sqlx::query_as::<_, ForwardRule>(
            "SELECT * FROM forward_rules WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Enabled rules for a domain in insertion order. Resolution scans
    /// this list exact -> prefix -> all, so among several same-type
    /// matches the earliest-created rule wins.
    pub async fn enabled_for_domain(&self, domain_id: i64) -> Result<Vec<ForwardRule>, sqlx::Error> {
        sqlx::query_as::<_, ForwardRule>(
            r#"
            SELECT * FROM forward_rules
            WHERE domain_id = ? AND enabled = 1 AND deleted_at IS NULL
            ORDER BY id
            "#,
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE forward_rules SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Input for one forwarding attempt record
#[derive(Debug, Clone, Default)]
pub struct NewForwardLog {
    pub rule_id: i64,
    pub from_addr: String,
    pub to_addr: String,
    pub forward_to: String,
    pub subject: String,
    pub status: String,
    pub error_msg: String,
    pub remote_ip: String,
}

#[derive(Clone)]
pub struct ForwardLogRepository {
    pool: SqlitePool,
}

impl ForwardLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, log: &NewForwardLog) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO forward_logs
                (created_at, rule_id, from_addr, to_addr, forward_to, subject,
                 status, error_msg, remote_ip)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now())
        .bind(log.rule_id)
        .bind(&log.from_addr)
        .bind(&log.to_addr)
        .bind(&log.forward_to)
        .bind(&log.subject)
        .bind(&log.status)
        .bind(&log.error_msg)
        .bind(&log.remote_ip)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<ForwardLog>, sqlx::Error> {
        sqlx::query_as::<_, ForwardLog>(
            "SELECT * FROM forward_logs WHERE deleted_at IS NULL ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn old_ids(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM forward_logs WHERE created_at < ? LIMIT ?")
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
        let sql = format!("DELETE FROM forward_logs WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
