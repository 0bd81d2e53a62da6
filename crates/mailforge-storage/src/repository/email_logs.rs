//! Email log repository

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::models::{EmailLog, Stats, TrendPoint};

/// Input for a delivery attempt log row
#[derive(Debug, Clone, Default)]
pub struct NewEmailLog {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// "success" or "failed"
    pub status: String,
    pub error_msg: String,
    /// "direct", "auto", or "smtp_<id>"
    pub channel: String,
    pub campaign_id: i64,
    pub tracking_id: String,
}

#[derive(Clone)]
pub struct EmailLogRepository {
    pool: SqlitePool,
}

impl EmailLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, log: &NewEmailLog) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO email_logs
                (created_at, updated_at, recipient, subject, body, status,
                 error_msg, channel, campaign_id, tracking_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&log.recipient)
        .bind(&log.subject)
        .bind(&log.body)
        .bind(&log.status)
        .bind(&log.error_msg)
        .bind(&log.channel)
        .bind(log.campaign_id)
        .bind(&log.tracking_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<EmailLog>, sqlx::Error> {
        sqlx::query_as::<_, EmailLog>(
            "SELECT * FROM email_logs WHERE deleted_at IS NULL ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn find_by_tracking(&self, tracking_id: &str) -> Result<Option<EmailLog>, sqlx::Error> {
        if tracking_id.is_empty() {
            return Ok(None);
        }
        sqlx::query_as::<_, EmailLog>(
            "SELECT * FROM email_logs WHERE tracking_id = ? AND deleted_at IS NULL",
        )
        .bind(tracking_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// First-open transition; false when already opened.
    pub async fn mark_opened(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE email_logs SET opened = 1, opened_at = ?, updated_at = ? WHERE id = ? AND opened = 0",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn increment_clicked(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE email_logs SET clicked_count = clicked_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// First-unsubscribe transition; false when already recorded.
    pub async fn mark_unsubscribed(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE email_logs SET unsubscribed = 1, updated_at = ? WHERE id = ? AND unsubscribed = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Dashboard statistics with a 12-hour hourly trend.
    pub async fn stats(&self) -> Result<Stats, sqlx::Error> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM email_logs")
            .fetch_one(&self.pool)
            .await?;

        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or_else(Utc::now);
        let today: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM email_logs WHERE created_at >= ?")
            .bind(start_of_day)
            .fetch_one(&self.pool)
            .await?;

        let success: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM email_logs WHERE status = 'success'")
                .fetch_one(&self.pool)
                .await?;
        let failure: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM email_logs WHERE status = 'failed'")
                .fetch_one(&self.pool)
                .await?;

        let last: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT created_at FROM email_logs ORDER BY created_at DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        let window_start = Utc::now() - Duration::hours(12);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT strftime('%H:00', created_at) AS hour, COUNT(*)
            FROM email_logs
            WHERE created_at >= ?
            GROUP BY hour
            ORDER BY hour ASC
            "#,
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;
        let by_hour: std::collections::HashMap<String, i64> = rows.into_iter().collect();

        let now = Utc::now();
        let trend = (0..=12)
            .rev()
            .map(|i| {
                let hour = (now - Duration::hours(i)).format("%H:00").to_string();
                let count = by_hour.get(&hour).copied().unwrap_or(0);
                TrendPoint { time: hour, count }
            })
            .collect();

        Ok(Stats {
            total_sent: total.0,
            today_sent: today.0,
            success_count: success.0,
            failure_count: failure.0,
            last_sent_time: last.map(|(t,)| t),
            trend,
        })
    }

    /// Retention cleanup batch.
    pub async fn old_ids(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM email_logs WHERE created_at < ? LIMIT ?")
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
        let sql = format!("DELETE FROM email_logs WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
