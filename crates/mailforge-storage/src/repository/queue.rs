//! Send queue repository
//!
//! The claim is the correctness keystone of the worker pool: a single
//! conditional UPDATE hands each task to exactly one worker without any
//! process-level locking, and survives crashes because abandoned
//! `processing` rows are re-opened after a grace period.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::models::QueueTask;

/// Input for a freshly enqueued task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub from_addr: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// JSON-encoded attachment list, empty for none
    pub attachments: String,
    pub channel_id: i64,
    pub campaign_id: i64,
    pub tracking_id: String,
}

#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, task: &NewTask) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO email_queue
                (created_at, updated_at, from_addr, recipient, subject, body,
                 attachments, channel_id, status, retries, next_retry,
                 campaign_id, tracking_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&task.from_addr)
        .bind(&task.recipient)
        .bind(&task.subject)
        .bind(&task.body)
        .bind(&task.attachments)
        .bind(task.channel_id)
        .bind(now)
        .bind(task.campaign_id)
        .bind(&task.tracking_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueTask>, sqlx::Error> {
        sqlx::query_as::<_, QueueTask>(
            "SELECT * FROM email_queue WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Claimable tasks: pending, or failed with retries left whose
    /// next_retry has arrived. Tasks of paused campaigns are withheld.
    pub async fn candidates(
        &self,
        limit: i64,
        max_retries: i64,
    ) -> Result<Vec<QueueTask>, sqlx::Error> {
        sqlx::query_as::<_, QueueTask>(
            r#"
            SELECT * FROM email_queue
            WHERE deleted_at IS NULL
              AND (status = 'pending'
                   OR (status = 'failed' AND retries < ? AND next_retry <= ?))
              AND (campaign_id = 0
                   OR campaign_id NOT IN (SELECT id FROM campaigns WHERE status = 'paused'))
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(max_retries)
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Conditional claim. Zero rows affected means another worker (or a
    /// retry tick) got there first.
    pub async fn claim(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET status = 'processing', updated_at = ?
            WHERE id = ? AND status IN ('pending', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_completed(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE email_queue SET status = 'completed', error_msg = '', updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transient failure: schedule the next attempt.
    pub async fn mark_failed(
        &self,
        id: i64,
        retries: i64,
        next_retry: DateTime<Utc>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'failed', retries = ?, next_retry = ?, error_msg = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(retries)
        .bind(next_retry)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal failure.
    pub async fn mark_dead(&self, id: i64, retries: i64, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE email_queue SET
                status = 'dead', retries = ?, error_msg = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(retries)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Crash recovery: `processing` rows untouched for longer than the
    /// grace period go back to `pending`.
    pub async fn reopen_stuck(&self, grace: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - grace;
        let result = sqlx::query(
            r#"
            UPDATE email_queue SET status = 'pending', updated_at = ?
            WHERE status = 'processing' AND updated_at < ?
            "#,
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Open work for a campaign: (pending or processing, failed with
    /// retries left). The campaign completes when both reach zero.
    pub async fn open_counts_for_campaign(
        &self,
        campaign_id: i64,
        max_retries: i64,
    ) -> Result<(i64, i64), sqlx::Error> {
        let open: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM email_queue
            WHERE campaign_id = ? AND status IN ('pending', 'processing') AND deleted_at IS NULL
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        let retryable: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM email_queue
            WHERE campaign_id = ? AND status = 'failed' AND retries < ? AND deleted_at IS NULL
            "#,
        )
        .bind(campaign_id)
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;

        Ok((open.0, retryable.0))
    }

    /// Per-status counts for the stats endpoint.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM email_queue WHERE deleted_at IS NULL GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Retention cleanup batch: ids of finished tasks older than the cutoff.
    pub async fn old_finished_ids(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM email_queue
            WHERE created_at < ? AND status IN ('completed', 'failed')
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Hard delete by id list (cleanup only).
    pub async fn delete_ids(&self, ids: &[i64]) -> Result<u64, sqlx::Error> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM email_queue WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn task(recipient: &str) -> NewTask {
        NewTask {
            from_addr: "noreply@example.com".to_string(),
            recipient: recipient.to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = QueueRepository::new(db.pool().clone());

        let id = repo.enqueue(&task("a@x.test")).await.unwrap();
        assert!(repo.claim(id).await.unwrap());
        // Second claim loses: the row is already processing.
        assert!(!repo.claim(id).await.unwrap());
    }

    #[tokio::test]
    async fn failed_task_claimable_again() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = QueueRepository::new(db.pool().clone());

        let id = repo.enqueue(&task("a@x.test")).await.unwrap();
        assert!(repo.claim(id).await.unwrap());
        repo.mark_failed(id, 1, Utc::now() - Duration::seconds(1), "boom")
            .await
            .unwrap();

        let candidates = repo.candidates(5, 3).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(repo.claim(id).await.unwrap());
    }

    #[tokio::test]
    async fn retry_not_due_is_withheld() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = QueueRepository::new(db.pool().clone());

        let id = repo.enqueue(&task("a@x.test")).await.unwrap();
        repo.claim(id).await.unwrap();
        repo.mark_failed(id, 1, Utc::now() + Duration::minutes(5), "later")
            .await
            .unwrap();

        assert!(repo.candidates(5, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn paused_campaign_tasks_are_withheld() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = QueueRepository::new(db.pool().clone());

        sqlx::query(
            "INSERT INTO campaigns (created_at, updated_at, status) VALUES (?, ?, 'paused')",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        let mut paused_task = task("a@x.test");
        paused_task.campaign_id = 1;
        repo.enqueue(&paused_task).await.unwrap();
        repo.enqueue(&task("b@x.test")).await.unwrap();

        let candidates = repo.candidates(5, 3).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].recipient, "b@x.test");
    }

    #[tokio::test]
    async fn stuck_processing_is_reopened() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let repo = QueueRepository::new(db.pool().clone());

        let id = repo.enqueue(&task("a@x.test")).await.unwrap();
        repo.claim(id).await.unwrap();

        // Backdate the claim beyond the grace period.
        sqlx::query("UPDATE email_queue SET updated_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::minutes(20))
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(repo.reopen_stuck(Duration::minutes(10)).await.unwrap(), 1);
        assert_eq!(repo.get(id).await.unwrap().unwrap().status, "pending");
    }
}
