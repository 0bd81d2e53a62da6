//! Retention-based data cleanup
//!
//! Deletes aged rows in small batches with pauses in between so the
//! single-writer database is never starved, removes attachment files
//! from disk, and prunes the directories they leave behind.

use chrono::{Duration, Utc};
use mailforge_common::Config;
use mailforge_storage::{
    AttachmentRepository, AttachmentStore, Database, EmailLogRepository, ForwardLogRepository,
    InboxRepository, QueueRepository,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{info, warn};

const BATCH_SIZE: i64 = 1000;
const ATTACHMENT_BATCH_SIZE: i64 = 500;
const BATCH_PAUSE: TokioDuration = TokioDuration::from_millis(50);

/// Counters for one cleanup pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupResult {
    pub email_logs: u64,
    pub inbox_items: u64,
    pub queue_items: u64,
    pub forward_logs: u64,
    pub attachments: u64,
    pub freed_bytes: u64,
    pub duration_ms: i64,
}

/// Cleanup job. A global flag rejects concurrent invocations: the
/// nightly schedule and the admin endpoint share one runner.
pub struct CleanupRunner {
    db: Database,
    files: AttachmentStore,
    running: AtomicBool,
}

impl CleanupRunner {
    pub fn new(db: Database, files: AttachmentStore) -> Self {
        Self {
            db,
            files,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one cleanup pass. Returns None when a pass is already in
    /// flight.
    pub async fn run(&self, config: &Config) -> Option<CleanupResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Cleanup already running, skipping");
            return None;
        }

        let started = Utc::now();
        let mut result = CleanupResult::default();

        info!("Cleanup started");

        if config.cleanup_email_log_days > 0 {
            result.email_logs = self.clean_email_logs(config.cleanup_email_log_days).await;
            info!(count = result.email_logs, "Cleaned email logs");
        }
        if config.cleanup_inbox_days > 0 {
            result.inbox_items = self.clean_inbox(config.cleanup_inbox_days).await;
            info!(count = result.inbox_items, "Cleaned inbox");
        }
        if config.cleanup_queue_days > 0 {
            result.queue_items = self.clean_queue(config.cleanup_queue_days).await;
            info!(count = result.queue_items, "Cleaned queue records");
        }
        if config.cleanup_forward_days > 0 {
            result.forward_logs = self.clean_forward_logs(config.cleanup_forward_days).await;
            info!(count = result.forward_logs, "Cleaned forward logs");
        }
        if config.cleanup_attach_days > 0 {
            let (count, freed) = self.clean_attachments(config.cleanup_attach_days).await;
            result.attachments = count;
            result.freed_bytes = freed;
            info!(count, freed_bytes = freed, "Cleaned attachments");
        }

        result.duration_ms = (Utc::now() - started).num_milliseconds();
        info!(duration_ms = result.duration_ms, "Cleanup finished");

        self.running.store(false, Ordering::SeqCst);
        Some(result)
    }

    async fn clean_email_logs(&self, days: i64) -> u64 {
        let repo = EmailLogRepository::new(self.db.pool().clone());
        let cutoff = Utc::now() - Duration::days(days);
        let mut total = 0;

        loop {
            let ids = match repo.old_ids(cutoff, BATCH_SIZE).await {
                Ok(ids) if !ids.is_empty() => ids,
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "Email log cleanup batch failed");
                    break;
                }
            };
            match repo.delete_ids(&ids).await {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    warn!(error = %e, "Email log delete failed");
                    break;
                }
            }
            sleep(BATCH_PAUSE).await;
        }

        total
    }

    async fn clean_inbox(&self, days: i64) -> u64 {
        let repo = InboxRepository::new(self.db.pool().clone());
        let cutoff = Utc::now() - Duration::days(days);
        let mut total = 0;

        loop {
            let ids = match repo.old_ids(cutoff, BATCH_SIZE).await {
                Ok(ids) if !ids.is_empty() => ids,
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "Inbox cleanup batch failed");
                    break;
                }
            };
            match repo.delete_ids(&ids).await {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    warn!(error = %e, "Inbox delete failed");
                    break;
                }
            }
            sleep(BATCH_PAUSE).await;
        }

        total
    }

    /// Queue cleanup only touches finished tasks; pending and dead rows
    /// are kept for inspection.
    async fn clean_queue(&self, days: i64) -> u64 {
        let repo = QueueRepository::new(self.db.pool().clone());
        let cutoff = Utc::now() - Duration::days(days);
        let mut total = 0;

        loop {
            let ids = match repo.old_finished_ids(cutoff, BATCH_SIZE).await {
                Ok(ids) if !ids.is_empty() => ids,
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "Queue cleanup batch failed");
                    break;
                }
            };
            match repo.delete_ids(&ids).await {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    warn!(error = %e, "Queue delete failed");
                    break;
                }
            }
            sleep(BATCH_PAUSE).await;
        }

        total
    }

    async fn clean_forward_logs(&self, days: i64) -> u64 {
        let repo = ForwardLogRepository::new(self.db.pool().clone());
        let cutoff = Utc::now() - Duration::days(days);
        let mut total = 0;

        loop {
            let ids = match repo.old_ids(cutoff, BATCH_SIZE).await {
                Ok(ids) if !ids.is_empty() => ids,
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "Forward log cleanup batch failed");
                    break;
                }
            };
            match repo.delete_ids(&ids).await {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    warn!(error = %e, "Forward log delete failed");
                    break;
                }
            }
            sleep(BATCH_PAUSE).await;
        }

        total
    }

    /// Attachments delete the disk file alongside the row, tally the
    /// freed bytes, and prune emptied directories afterwards.
    async fn clean_attachments(&self, days: i64) -> (u64, u64) {
        let repo = AttachmentRepository::new(self.db.pool().clone());
        let cutoff = Utc::now() - Duration::days(days);
        let mut count = 0;
        let mut freed = 0;

        loop {
            let files = match repo.older_than(cutoff, ATTACHMENT_BATCH_SIZE).await {
                Ok(files) if !files.is_empty() => files,
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "Attachment cleanup batch failed");
                    break;
                }
            };

            let mut ids = Vec::with_capacity(files.len());
            for file in &files {
                ids.push(file.id);
                match self.files.remove(&file.file_path).await {
                    Ok(size) => freed += size,
                    Err(e) => warn!(path = %file.file_path, error = %e, "Failed to delete attachment file"),
                }
            }

            match repo.delete_ids(&ids).await {
                Ok(deleted) => count += deleted,
                Err(e) => {
                    warn!(error = %e, "Attachment delete failed");
                    break;
                }
            }
            sleep(BATCH_PAUSE).await;
        }

        self.files.prune_empty_dirs().await;
        (count, freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailforge_storage::{NewAttachmentFile, NewEmailLog, NewTask};
    use tempfile::TempDir;

    async fn setup() -> (Database, TempDir, CleanupRunner) {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let dir = TempDir::new().unwrap();
        let files = AttachmentStore::new(dir.path());
        let runner = CleanupRunner::new(db.clone(), files);
        (db, dir, runner)
    }

    fn retention_config() -> Config {
        let mut config = Config::default();
        config.cleanup_email_log_days = 7;
        config.cleanup_inbox_days = 7;
        config.cleanup_queue_days = 7;
        config.cleanup_forward_days = 7;
        config.cleanup_attach_days = 7;
        config
    }

    async fn backdate(db: &Database, table: &str, days: i64) {
        let sql = format!("UPDATE {} SET created_at = ?", table);
        sqlx::query(&sql)
            .bind(Utc::now() - Duration::days(days))
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removes_aged_rows_and_files() {
        let (db, dir, runner) = setup().await;

        // Aged email log.
        EmailLogRepository::new(db.pool().clone())
            .create(&NewEmailLog::default())
            .await
            .unwrap();
        backdate(&db, "email_logs", 10).await;

        // Aged completed queue task and one still-pending task.
        let queue = QueueRepository::new(db.pool().clone());
        let done = queue.enqueue(&NewTask::default()).await.unwrap();
        queue.claim(done).await.unwrap();
        queue.mark_completed(done).await.unwrap();
        let pending = queue.enqueue(&NewTask::default()).await.unwrap();
        backdate(&db, "email_queue", 10).await;

        // Aged attachment with a real file.
        let store = AttachmentStore::new(dir.path());
        let path = store.save_upload("old.bin", b"0123456789").await.unwrap();
        AttachmentRepository::new(db.pool().clone())
            .create(&NewAttachmentFile {
                filename: "old.bin".to_string(),
                file_path: path.clone(),
                file_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        backdate(&db, "attachment_files", 10).await;

        let result = runner.run(&retention_config()).await.unwrap();
        assert_eq!(result.email_logs, 1);
        assert_eq!(result.queue_items, 1);
        assert_eq!(result.attachments, 1);
        assert_eq!(result.freed_bytes, 10);

        // The pending task survives; the file is gone.
        assert!(queue.get(pending).await.unwrap().is_some());
        assert!(queue.get(done).await.unwrap().is_none());
        assert!(store.read(&path).await.is_err());
    }

    #[tokio::test]
    async fn fresh_rows_survive() {
        let (db, _dir, runner) = setup().await;
        let logs = EmailLogRepository::new(db.pool().clone());
        logs.create(&NewEmailLog::default()).await.unwrap();

        let result = runner.run(&retention_config()).await.unwrap();
        assert_eq!(result.email_logs, 0);
        assert_eq!(logs.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected() {
        let (_db, _dir, runner) = setup().await;
        runner.running.store(true, Ordering::SeqCst);
        assert!(runner.run(&retention_config()).await.is_none());
    }
}
