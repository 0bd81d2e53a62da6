//! Scheduler: campaign promotion and nightly cleanup
//!
//! Two periodic duties: promote `scheduled` campaigns whose start time
//! has arrived (every minute), and run retention cleanup at startup and
//! daily at 03:00 local time.

use chrono::{Local, NaiveTime, TimeZone};
use mailforge_common::ConfigStore;
use mailforge_storage::{CampaignRepository, Database};
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration as TokioDuration};
use tracing::{error, info};

use crate::campaign::CampaignEngine;
use crate::cleanup::CleanupRunner;
use crate::queue::Deliverer;

const PROMOTION_TICK: TokioDuration = TokioDuration::from_secs(60);

/// Hour of day (local time) for the nightly cleanup.
const CLEANUP_HOUR: u32 = 3;

pub struct Scheduler<D: Deliverer> {
    db: Database,
    config: Arc<ConfigStore>,
    campaigns: Arc<CampaignEngine<D>>,
    cleanup: Arc<CleanupRunner>,
}

impl<D: Deliverer + 'static> Scheduler<D> {
    pub fn new(
        db: Database,
        config: Arc<ConfigStore>,
        campaigns: Arc<CampaignEngine<D>>,
        cleanup: Arc<CleanupRunner>,
    ) -> Self {
        Self {
            db,
            config,
            campaigns,
            cleanup,
        }
    }

    /// Run both duties. Never returns.
    pub async fn run(self: Arc<Self>) {
        let promoter = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(PROMOTION_TICK);
            loop {
                ticker.tick().await;
                if let Err(e) = promoter.promote_due_campaigns().await {
                    error!(error = %e, "Campaign promotion tick failed");
                }
            }
        });

        // Initial cleanup at startup when enabled, then nightly.
        if self.config.snapshot().cleanup_enabled {
            info!("Running startup cleanup");
            self.cleanup.run(&self.config.snapshot()).await;
        }

        loop {
            let wait = duration_until_next(CLEANUP_HOUR);
            info!(seconds = wait.as_secs(), "Next scheduled cleanup");
            sleep(wait).await;

            let config = self.config.snapshot();
            if config.cleanup_enabled {
                info!("Running nightly cleanup");
                self.cleanup.run(&config).await;
            }
        }
    }

    /// Drive every due `scheduled` campaign through expansion.
    pub async fn promote_due_campaigns(&self) -> anyhow::Result<()> {
        let repo = CampaignRepository::new(self.db.pool().clone());
        let due = repo.scheduled_ready().await?;

        for campaign in due {
            info!(campaign = campaign.id, name = %campaign.name, "Promoting scheduled campaign");
            if let Err(e) = self.campaigns.process(campaign).await {
                error!(error = %e, "Failed to start scheduled campaign");
            }
        }

        Ok(())
    }
}

/// Time until the next local occurrence of `hour`:00.
fn duration_until_next(hour: u32) -> TokioDuration {
    let now = Local::now();
    let target_time = NaiveTime::from_hms_opt(hour, 0, 0).expect("valid time of day");
    let mut next = now.date_naive().and_time(target_time);
    if Local
        .from_local_datetime(&next)
        .earliest()
        .map(|t| t <= now)
        .unwrap_or(true)
    {
        next += chrono::Duration::days(1);
    }

    let next_local = Local
        .from_local_datetime(&next)
        .earliest()
        .unwrap_or_else(|| now + chrono::Duration::days(1));
    let delta = next_local - now;
    TokioDuration::from_secs(delta.num_seconds().max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::SendRequest;
    use crate::queue::QueueManager;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use mailforge_storage::{CampaignInput, ChannelInput, ChannelRepository, ContactGroupRepository, ContactRepository};
    use uuid::Uuid;

    struct NullDeliverer;

    #[async_trait]
    impl Deliverer for NullDeliverer {
        async fn send(&self, _req: &SendRequest) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn next_cleanup_is_within_a_day() {
        let wait = duration_until_next(CLEANUP_HOUR);
        assert!(wait.as_secs() >= 1);
        assert!(wait.as_secs() <= 24 * 60 * 60);
    }

    #[tokio::test]
    async fn due_scheduled_campaign_is_promoted() {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();

        let config = Arc::new(
            ConfigStore::open(
                std::env::temp_dir().join(format!("mailforge-test-{}.json", Uuid::new_v4())),
            )
            .unwrap(),
        );
        let queue = Arc::new(QueueManager::new(db.clone(), Arc::new(NullDeliverer)));
        let engine = Arc::new(CampaignEngine::new(db.clone(), config.clone(), queue));
        let files = mailforge_storage::AttachmentStore::new(std::env::temp_dir());
        let cleanup = Arc::new(CleanupRunner::new(db.clone(), files));
        let scheduler = Scheduler::new(db.clone(), config, engine, cleanup);

        // One contact and a campaign already due.
        let group = ContactGroupRepository::new(db.pool().clone())
            .create("g", "")
            .await
            .unwrap();
        ContactRepository::new(db.pool().clone())
            .create("a@x.test", "A", group.id, "")
            .await
            .unwrap();
        let channel = ChannelRepository::new(db.pool().clone())
            .create(&ChannelInput {
                name: "c".to_string(),
                host: "h".to_string(),
                port: 587,
                username: "u@x.test".to_string(),
                password: String::new(),
                implicit_tls: false,
                is_default: false,
            })
            .await
            .unwrap();
        let campaigns = CampaignRepository::new(db.pool().clone());
        let campaign = campaigns
            .create(&CampaignInput {
                name: "due".to_string(),
                subject: "s".to_string(),
                body: "b".to_string(),
                channel_id: channel.id,
                target_type: "group".to_string(),
                target_group_id: group.id,
                target_list: String::new(),
                scheduled_at: Some(Utc::now() - chrono::Duration::minutes(1)),
            })
            .await
            .unwrap();
        campaigns.set_status(campaign.id, "scheduled").await.unwrap();

        scheduler.promote_due_campaigns().await.unwrap();

        assert_eq!(
            campaigns.get(campaign.id).await.unwrap().unwrap().status,
            "processing"
        );
    }
}
