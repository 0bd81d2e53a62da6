//! Campaign repository

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::Campaign;

/// Campaign create/update input
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CampaignInput {
    pub name: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub channel_id: i64,
    #[serde(default = "default_target_type")]
    pub target_type: String,
    #[serde(default)]
    pub target_group_id: i64,
    #[serde(default)]
    pub target_list: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_target_type() -> String {
    "group".to_string()
}

#[derive(Clone)]
pub struct CampaignRepository {
    pool: SqlitePool,
}

impl CampaignRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &CampaignInput) -> Result<Campaign, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns
                (created_at, updated_at, name, subject, body, channel_id,
                 target_type, target_group_id, target_list, status, scheduled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'draft', ?)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&input.name)
        .bind(&input.subject)
        .bind(&input.body)
        .bind(input.channel_id)
        .bind(&input.target_type)
        .bind(input.target_group_id)
        .bind(&input.target_list)
        .bind(input.scheduled_at)
        .fetch_one(&self.pool)
        .await
    }

    /// Only draft campaigns may be edited.
    pub async fn update(&self, id: i64, input: &CampaignInput) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                name = ?, subject = ?, body = ?, channel_id = ?,
                target_type = ?, target_group_id = ?, target_list = ?,
                scheduled_at = ?, updated_at = ?
            WHERE id = ? AND status = 'draft' AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(&input.name)
        .bind(&input.subject)
        .bind(&input.body)
        .bind(input.channel_id)
        .bind(&input.target_type)
        .bind(input.target_group_id)
        .bind(&input.target_list)
        .bind(input.scheduled_at)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(&self) -> Result<Vec<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE deleted_at IS NULL ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Deletion is allowed in any state; outstanding queue tasks run to
    /// completion and tolerate the missing row.
    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE campaigns SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(&self, id: i64, status: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Guarded transition: the row moves to `to` only when currently in
    /// one of `from`.
    pub async fn transition(&self, id: i64, from: &[&str], to: &str) -> Result<bool, sqlx::Error> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ? AND status IN ({}) AND deleted_at IS NULL",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(to).bind(Utc::now()).bind(id);
        for status in from {
            query = query.bind(*status);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enter `processing` with a fresh counter snapshot.
    pub async fn begin_processing(&self, id: i64, total: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'processing', total_count = ?, sent_count = 0,
                success_count = 0, fail_count = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(total)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal accounting for one task. Atomic `col = col + 1`; affects
    /// zero rows when the campaign was deleted, which is fine.
    pub async fn record_send_outcome(&self, id: i64, success: bool) -> Result<(), sqlx::Error> {
        let sql = if success {
            "UPDATE campaigns SET sent_count = sent_count + 1, success_count = success_count + 1, updated_at = ? WHERE id = ?"
        } else {
            "UPDATE campaigns SET sent_count = sent_count + 1, fail_count = fail_count + 1, updated_at = ? WHERE id = ?"
        };
        sqlx::query(sql)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_open(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE campaigns SET open_count = open_count + 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_click(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE campaigns SET click_count = click_count + 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_unsubscribe(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE campaigns SET unsubscribe_count = unsubscribe_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Scheduled campaigns whose start time has arrived.
    pub async fn scheduled_ready(&self) -> Result<Vec<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled'
              AND scheduled_at IS NOT NULL
              AND scheduled_at <= ?
              AND deleted_at IS NULL
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn input() -> CampaignInput {
        CampaignInput {
            name: "launch".to_string(),
            subject: "Hello".to_string(),
            body: "<p>Hi {name}</p>".to_string(),
            channel_id: 1,
            target_type: "group".to_string(),
            target_group_id: 1,
            target_list: String::new(),
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn guarded_transition() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = CampaignRepository::new(db.pool().clone());
        let c = repo.create(&input()).await.unwrap();

        // paused only reachable from processing
        assert!(!repo.transition(c.id, &["processing"], "paused").await.unwrap());
        repo.set_status(c.id, "processing").await.unwrap();
        assert!(repo.transition(c.id, &["processing"], "paused").await.unwrap());
        assert_eq!(repo.get(c.id).await.unwrap().unwrap().status, "paused");
    }

    #[tokio::test]
    async fn outcome_counters_survive_deleted_campaign() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = CampaignRepository::new(db.pool().clone());
        let c = repo.create(&input()).await.unwrap();

        repo.record_send_outcome(c.id, true).await.unwrap();
        repo.record_send_outcome(c.id, false).await.unwrap();
        let row = repo.get(c.id).await.unwrap().unwrap();
        assert_eq!(row.sent_count, 2);
        assert_eq!(row.success_count, 1);
        assert_eq!(row.fail_count, 1);

        // No error against a hard-deleted campaign.
        sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(c.id)
            .execute(db.pool())
            .await
            .unwrap();
        repo.record_send_outcome(c.id, true).await.unwrap();
    }
}
