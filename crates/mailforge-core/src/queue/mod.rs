//! Persistent send queue and worker pool
//!
//! Tasks are enqueued by the API, by inbound forwarding, and by the
//! campaign engine. A 2-second tick claims up to WORKER_POOL tasks with
//! a conditional UPDATE (the only race-critical operation in the system)
//! and drives each through the delivery engine on its own tokio task.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use mailforge_storage::{CampaignRepository, Database, NewTask, QueueRepository, QueueTask};
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use crate::delivery::{Attachment, DeliveryEngine, SendRequest};

/// Attempts beyond this move the task to `dead`.
pub const MAX_RETRIES: i64 = 3;

/// Linear backoff unit: retry n waits n * RETRY_INTERVAL_MINS.
pub const RETRY_INTERVAL_MINS: i64 = 5;

/// Tasks claimed per tick.
pub const WORKER_POOL: i64 = 5;

/// Worker tick period.
const TICK_SECS: u64 = 2;

/// `processing` rows older than this are presumed abandoned by a dead
/// worker and re-opened.
const STUCK_GRACE_MINS: i64 = 10;

/// Transport seam so the worker is testable without a network.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn send(&self, req: &SendRequest) -> Result<()>;
}

#[async_trait]
impl Deliverer for DeliveryEngine {
    async fn send(&self, req: &SendRequest) -> Result<()> {
        DeliveryEngine::send(self, req).await
    }
}

/// Queue manager: enqueue API plus the background worker loop.
pub struct QueueManager<D: Deliverer> {
    db: Database,
    engine: Arc<D>,
}

impl<D: Deliverer + 'static> QueueManager<D> {
    pub fn new(db: Database, engine: Arc<D>) -> Self {
        Self { db, engine }
    }

    /// Persist a send request as a pending task. Returns the queue id.
    pub async fn enqueue(&self, req: &SendRequest) -> Result<i64> {
        let attachments = if req.attachments.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&req.attachments)?
        };

        let repo = QueueRepository::new(self.db.pool().clone());
        let id = repo
            .enqueue(&NewTask {
                from_addr: req.from.clone(),
                recipient: req.to.clone(),
                subject: req.subject.clone(),
                body: req.body.clone(),
                attachments,
                channel_id: req.channel_id,
                campaign_id: req.campaign_id,
                tracking_id: req.tracking_id.clone(),
            })
            .await?;

        debug!(queue_id = id, recipient = %req.to, "Enqueued send task");
        Ok(id)
    }

    /// Run the worker loop. Never returns.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(TokioDuration::from_secs(TICK_SECS));
        info!("Queue worker started (pool width {})", WORKER_POOL);

        loop {
            ticker.tick().await;
            if let Err(e) = self.clone().process_tick().await {
                error!(error = %e, "Queue tick failed");
            }
        }
    }

    /// One tick: recover stuck tasks, then claim and dispatch candidates.
    pub async fn process_tick(self: Arc<Self>) -> Result<()> {
        let repo = QueueRepository::new(self.db.pool().clone());

        let reopened = repo.reopen_stuck(Duration::minutes(STUCK_GRACE_MINS)).await?;
        if reopened > 0 {
            warn!(count = reopened, "Re-opened stuck processing tasks");
        }

        let tasks = repo.candidates(WORKER_POOL, MAX_RETRIES).await?;
        if tasks.is_empty() {
            return Ok(());
        }

        for task in tasks {
            // The claim serializes workers: zero rows affected means a
            // competing claim (or retry tick) already took the task.
            if !repo.claim(task.id).await? {
                continue;
            }

            let manager = self.clone();
            tokio::spawn(async move {
                manager.execute(task).await;
            });
        }

        Ok(())
    }

    /// Drive one claimed task through the delivery engine and record the
    /// outcome.
    async fn execute(&self, task: QueueTask) {
        let req = match task_to_request(&task) {
            Ok(req) => req,
            Err(e) => {
                // Unparseable payload can never succeed; kill it now.
                error!(task = task.id, error = %e, "Task payload invalid");
                self.finish_failure(&task, &format!("invalid payload: {}", e), true)
                    .await;
                return;
            }
        };

        match self.engine.send(&req).await {
            Ok(()) => self.finish_success(&task).await,
            Err(e) => {
                let terminal = task.retries + 1 >= MAX_RETRIES;
                self.finish_failure(&task, &format!("{:#}", e), terminal).await;
            }
        }
    }

    async fn finish_success(&self, task: &QueueTask) {
        let repo = QueueRepository::new(self.db.pool().clone());
        if let Err(e) = repo.mark_completed(task.id).await {
            error!(task = task.id, error = %e, "Failed to mark task completed");
            return;
        }
        info!(task = task.id, recipient = %task.recipient, "Task completed");

        if task.campaign_id > 0 {
            self.account_terminal(task.campaign_id, true).await;
        }
    }

    async fn finish_failure(&self, task: &QueueTask, error_msg: &str, terminal: bool) {
        let repo = QueueRepository::new(self.db.pool().clone());
        // A dead task always reports all retry attempts spent, even when
        // it was killed early for an unrecoverable payload.
        let retries = if terminal {
            (task.retries + 1).max(MAX_RETRIES)
        } else {
            task.retries + 1
        };

        if terminal {
            if let Err(e) = repo.mark_dead(task.id, retries, error_msg).await {
                error!(task = task.id, error = %e, "Failed to mark task dead");
                return;
            }
            warn!(task = task.id, retries, "Task dead: {}", error_msg);

            // A failure counts against the campaign exactly once, at the
            // moment the task dies.
            if task.campaign_id > 0 {
                self.account_terminal(task.campaign_id, false).await;
            }
        } else {
            let next_retry = Utc::now() + Duration::minutes(RETRY_INTERVAL_MINS * retries);
            if let Err(e) = repo.mark_failed(task.id, retries, next_retry, error_msg).await {
                error!(task = task.id, error = %e, "Failed to mark task failed");
            }
            warn!(
                task = task.id,
                retries,
                next_retry = %next_retry,
                "Task failed, will retry: {}",
                error_msg
            );
        }
    }

    /// Campaign counters plus the completion check. A deleted campaign
    /// makes both no-ops.
    async fn account_terminal(&self, campaign_id: i64, success: bool) {
        let campaigns = CampaignRepository::new(self.db.pool().clone());
        if let Err(e) = campaigns.record_send_outcome(campaign_id, success).await {
            error!(campaign = campaign_id, error = %e, "Failed to update campaign counters");
        }

        if let Err(e) = self.check_campaign_completion(campaign_id).await {
            error!(campaign = campaign_id, error = %e, "Campaign completion check failed");
        }
    }

    /// A `processing` campaign completes when no task of it remains
    /// pending, processing, or failed-with-retries-left.
    pub async fn check_campaign_completion(&self, campaign_id: i64) -> Result<bool> {
        let campaigns = CampaignRepository::new(self.db.pool().clone());
        let campaign = match campaigns.get(campaign_id).await? {
            Some(campaign) => campaign,
            None => return Ok(false),
        };
        if campaign.status != "processing" {
            return Ok(false);
        }

        let queue = QueueRepository::new(self.db.pool().clone());
        let (open, retryable) = queue
            .open_counts_for_campaign(campaign_id, MAX_RETRIES)
            .await?;

        if open == 0 && retryable == 0 {
            campaigns
                .transition(campaign_id, &["processing"], "completed")
                .await?;
            info!(
                campaign = campaign_id,
                total = campaign.total_count,
                success = campaign.success_count,
                "Campaign completed"
            );
            return Ok(true);
        }

        Ok(false)
    }
}

/// Rebuild the engine request from a persisted task.
fn task_to_request(task: &QueueTask) -> Result<SendRequest> {
    let attachments: Vec<Attachment> = if task.attachments.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&task.attachments)?
    };

    Ok(SendRequest {
        from: task.from_addr.clone(),
        to: task.recipient.clone(),
        subject: task.subject.clone(),
        body: task.body.clone(),
        attachments,
        channel_id: task.channel_id,
        campaign_id: task.campaign_id,
        tracking_id: task.tracking_id.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deliverer that fails the first `failures` calls, then succeeds.
    struct FlakyDeliverer {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyDeliverer {
        fn failing_forever() -> Self {
            Self {
                failures: usize::MAX,
                calls: AtomicUsize::new(0),
            }
        }

        fn always_ok() -> Self {
            Self {
                failures: 0,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Deliverer for FlakyDeliverer {
        async fn send(&self, _req: &SendRequest) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(anyhow!("simulated transport failure"))
            } else {
                Ok(())
            }
        }
    }

    async fn setup(deliverer: FlakyDeliverer) -> (Database, Arc<QueueManager<FlakyDeliverer>>) {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        let manager = Arc::new(QueueManager::new(db.clone(), Arc::new(deliverer)));
        (db, manager)
    }

    async fn drain_tick<D: Deliverer + 'static>(manager: &Arc<QueueManager<D>>) {
        manager.clone().process_tick().await.unwrap();
        // Dispatched tasks run on spawned tasks; give them a beat.
        tokio::time::sleep(TokioDuration::from_millis(50)).await;
    }

    fn request(to: &str) -> SendRequest {
        SendRequest {
            to: to.to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_marks_completed() {
        let (db, manager) = setup(FlakyDeliverer::always_ok()).await;
        let id = manager.enqueue(&request("a@x.test")).await.unwrap();

        drain_tick(&manager).await;

        let repo = QueueRepository::new(db.pool().clone());
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, "completed");
        assert!(task.error_msg.is_empty());
    }

    #[tokio::test]
    async fn failure_schedules_linear_backoff() {
        let (db, manager) = setup(FlakyDeliverer::failing_forever()).await;
        let id = manager.enqueue(&request("a@x.test")).await.unwrap();

        drain_tick(&manager).await;

        let repo = QueueRepository::new(db.pool().clone());
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, "failed");
        assert_eq!(task.retries, 1);
        assert!(task.error_msg.contains("simulated transport failure"));
        assert!(task.next_retry > Utc::now() + Duration::minutes(4));
        assert!(task.next_retry < Utc::now() + Duration::minutes(6));
    }

    #[tokio::test]
    async fn retries_exhaust_to_dead_with_single_fail_count() {
        let (db, manager) = setup(FlakyDeliverer::failing_forever()).await;

        // Campaign in processing with one task.
        sqlx::query(
            "INSERT INTO campaigns (created_at, updated_at, status, total_count) VALUES (?, ?, 'processing', 1)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        let mut req = request("a@x.test");
        req.campaign_id = 1;
        let id = manager.enqueue(&req).await.unwrap();

        let repo = QueueRepository::new(db.pool().clone());
        for _ in 0..MAX_RETRIES {
            // Make any scheduled retry due immediately.
            sqlx::query("UPDATE email_queue SET next_retry = ? WHERE id = ?")
                .bind(Utc::now() - Duration::seconds(1))
                .bind(id)
                .execute(db.pool())
                .await
                .unwrap();
            drain_tick(&manager).await;
        }

        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, "dead");
        assert_eq!(task.retries, MAX_RETRIES);

        // Exactly one terminal failure accounted, and the campaign
        // completed because nothing claimable remains.
        let campaign: (i64, i64, i64, String) = sqlx::query_as(
            "SELECT sent_count, fail_count, success_count, status FROM campaigns WHERE id = 1",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(campaign.0, 1);
        assert_eq!(campaign.1, 1);
        assert_eq!(campaign.2, 0);
        assert_eq!(campaign.3, "completed");
    }

    #[tokio::test]
    async fn campaign_completes_after_all_success() {
        let (db, manager) = setup(FlakyDeliverer::always_ok()).await;

        sqlx::query(
            "INSERT INTO campaigns (created_at, updated_at, status, total_count) VALUES (?, ?, 'processing', 3)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        for recipient in ["a@x.test", "b@x.test", "c@x.test"] {
            let mut req = request(recipient);
            req.campaign_id = 1;
            manager.enqueue(&req).await.unwrap();
        }

        drain_tick(&manager).await;

        let campaign: (i64, i64, String) = sqlx::query_as(
            "SELECT sent_count, success_count, status FROM campaigns WHERE id = 1",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(campaign.0, 3);
        assert_eq!(campaign.1, 3);
        assert_eq!(campaign.2, "completed");
    }

    #[tokio::test]
    async fn paused_campaign_tasks_resume_on_next_tick() {
        let (db, manager) = setup(FlakyDeliverer::always_ok()).await;

        sqlx::query(
            "INSERT INTO campaigns (created_at, updated_at, status, total_count) VALUES (?, ?, 'paused', 1)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        let mut req = request("a@x.test");
        req.campaign_id = 1;
        let id = manager.enqueue(&req).await.unwrap();

        drain_tick(&manager).await;
        let repo = QueueRepository::new(db.pool().clone());
        assert_eq!(repo.get(id).await.unwrap().unwrap().status, "pending");

        // Resume, then the very next tick picks the task up.
        sqlx::query("UPDATE campaigns SET status = 'processing' WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();
        drain_tick(&manager).await;
        assert_eq!(repo.get(id).await.unwrap().unwrap().status, "completed");
    }
}
