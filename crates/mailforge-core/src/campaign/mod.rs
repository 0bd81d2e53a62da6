//! Campaign engine
//!
//! Lifecycle: draft -> (scheduled | processing) -> paused <-> processing
//! -> completed, with failed reachable from any non-terminal state.
//! Expansion fans one template out to a queue task per recipient, with
//! per-message tracking injection.

pub mod render;

use mailforge_common::types::CampaignStatus;
use mailforge_common::ConfigStore;
use mailforge_storage::{
    Campaign, CampaignRepository, ChannelRepository, ContactRepository, Database,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration as TokioDuration;
use tracing::{error, info};
use uuid::Uuid;

use crate::delivery::SendRequest;
use crate::queue::{Deliverer, QueueManager};

/// Upper bound on a single campaign's fan-out.
const PROCESS_TIMEOUT: TokioDuration = TokioDuration::from_secs(30 * 60);

/// Campaign engine errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign not found")]
    NotFound,

    #[error("Campaign can only be started from draft or failed")]
    NotStartable,

    #[error("Campaign is not in processing status")]
    NotProcessing,

    #[error("Campaign is not paused")]
    NotPaused,

    #[error("No recipients found")]
    EmptyRecipients,

    #[error("Invalid sender channel")]
    InvalidChannel,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Recipient produced by target expansion
#[derive(Debug, Clone)]
struct Recipient {
    email: String,
    name: String,
}

/// Campaign engine
pub struct CampaignEngine<D: Deliverer> {
    db: Database,
    config: Arc<ConfigStore>,
    queue: Arc<QueueManager<D>>,
}

impl<D: Deliverer + 'static> CampaignEngine<D> {
    pub fn new(db: Database, config: Arc<ConfigStore>, queue: Arc<QueueManager<D>>) -> Self {
        Self { db, config, queue }
    }

    /// Start a campaign. A future `scheduled_at` parks it in `scheduled`
    /// for the scheduler to promote; otherwise expansion begins now.
    pub async fn start(&self, id: i64) -> Result<Campaign, CampaignError> {
        let campaigns = CampaignRepository::new(self.db.pool().clone());
        let campaign = campaigns.get(id).await?.ok_or(CampaignError::NotFound)?;

        if campaign.status != CampaignStatus::Draft.as_str()
            && campaign.status != CampaignStatus::Failed.as_str()
        {
            return Err(CampaignError::NotStartable);
        }

        if let Some(scheduled_at) = campaign.scheduled_at {
            if scheduled_at > chrono::Utc::now() {
                campaigns
                    .set_status(id, CampaignStatus::Scheduled.as_str())
                    .await?;
                info!(campaign = id, at = %scheduled_at, "Campaign scheduled");
                return Ok(campaigns.get(id).await?.ok_or(CampaignError::NotFound)?);
            }
        }

        self.process(campaign).await
    }

    /// Expand targets and begin the asynchronous fan-out. Also the entry
    /// point for the scheduler promoting `scheduled` campaigns.
    pub async fn process(&self, campaign: Campaign) -> Result<Campaign, CampaignError> {
        let campaigns = CampaignRepository::new(self.db.pool().clone());

        let recipients = match self.expand(&campaign).await? {
            recipients if recipients.is_empty() => {
                campaigns
                    .set_status(campaign.id, CampaignStatus::Failed.as_str())
                    .await?;
                return Err(CampaignError::EmptyRecipients);
            }
            recipients => recipients,
        };

        let channels = ChannelRepository::new(self.db.pool().clone());
        let channel = match channels.get(campaign.channel_id).await? {
            Some(channel) => channel,
            None => {
                campaigns
                    .set_status(campaign.id, CampaignStatus::Failed.as_str())
                    .await?;
                return Err(CampaignError::InvalidChannel);
            }
        };

        campaigns
            .begin_processing(campaign.id, recipients.len() as i64)
            .await?;
        info!(
            campaign = campaign.id,
            recipients = recipients.len(),
            "Campaign processing started"
        );

        let base_url = self.config.snapshot().effective_base_url();
        let queue = self.queue.clone();
        let db = self.db.clone();
        let campaign_id = campaign.id;
        let subject = campaign.subject.clone();
        let body = campaign.body.clone();
        let from = channel.username.clone();
        let channel_id = channel.id;

        // The fan-out runs detached under a hard timeout. A panic or an
        // internal error marks the campaign failed instead of taking the
        // process down.
        let worker = tokio::spawn(async move {
            for recipient in recipients {
                let tracking_id = Uuid::new_v4().to_string();
                let rendered = render::render_recipient_body(
                    &body,
                    &recipient.name,
                    &recipient.email,
                    &base_url,
                    &tracking_id,
                );

                queue
                    .enqueue(&SendRequest {
                        from: from.clone(),
                        to: recipient.email.clone(),
                        subject: subject.clone(),
                        body: rendered,
                        channel_id,
                        campaign_id,
                        tracking_id,
                        ..Default::default()
                    })
                    .await?;
            }
            anyhow::Ok(())
        });

        let db_for_watchdog = db;
        let abort = worker.abort_handle();
        tokio::spawn(async move {
            let failed = match tokio::time::timeout(PROCESS_TIMEOUT, worker).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(format!("fan-out error: {}", e)),
                Ok(Err(join_err)) => Some(format!("fan-out panicked: {}", join_err)),
                Err(_) => {
                    abort.abort();
                    Some("fan-out timed out".to_string())
                }
            };

            if let Some(reason) = failed {
                error!(campaign = campaign_id, reason = %reason, "Campaign failed");
                let campaigns = CampaignRepository::new(db_for_watchdog.pool().clone());
                if let Err(e) = campaigns
                    .set_status(campaign_id, CampaignStatus::Failed.as_str())
                    .await
                {
                    error!(campaign = campaign_id, error = %e, "Failed to mark campaign failed");
                }
            }
        });

        Ok(campaigns
            .get(campaign.id)
            .await?
            .ok_or(CampaignError::NotFound)?)
    }

    /// Pause withholds future claims; in-flight tasks finish normally.
    pub async fn pause(&self, id: i64) -> Result<Campaign, CampaignError> {
        let campaigns = CampaignRepository::new(self.db.pool().clone());
        if !campaigns
            .transition(
                id,
                &[CampaignStatus::Processing.as_str()],
                CampaignStatus::Paused.as_str(),
            )
            .await?
        {
            return Err(CampaignError::NotProcessing);
        }
        info!(campaign = id, "Campaign paused");
        campaigns.get(id).await?.ok_or(CampaignError::NotFound)
    }

    pub async fn resume(&self, id: i64) -> Result<Campaign, CampaignError> {
        let campaigns = CampaignRepository::new(self.db.pool().clone());
        if !campaigns
            .transition(
                id,
                &[CampaignStatus::Paused.as_str()],
                CampaignStatus::Processing.as_str(),
            )
            .await?
        {
            return Err(CampaignError::NotPaused);
        }
        info!(campaign = id, "Campaign resumed");
        campaigns.get(id).await?.ok_or(CampaignError::NotFound)
    }

    /// One-off test delivery through the campaign's channel, without
    /// campaign accounting or tracking.
    pub async fn test_send(&self, id: i64, to: &str) -> Result<i64, CampaignError> {
        let campaigns = CampaignRepository::new(self.db.pool().clone());
        let campaign = campaigns.get(id).await?.ok_or(CampaignError::NotFound)?;

        let channels = ChannelRepository::new(self.db.pool().clone());
        let channel = channels
            .get(campaign.channel_id)
            .await?
            .ok_or(CampaignError::InvalidChannel)?;

        let body = render::substitute(&campaign.body, "Test User", to);
        let queue_id = self
            .queue
            .enqueue(&SendRequest {
                from: channel.username.clone(),
                to: to.to_string(),
                subject: format!("[Test] {}", campaign.subject),
                body,
                channel_id: channel.id,
                ..Default::default()
            })
            .await?;

        Ok(queue_id)
    }

    /// Compute the recipient list for the campaign target.
    async fn expand(&self, campaign: &Campaign) -> Result<Vec<Recipient>, CampaignError> {
        match campaign.target_type.as_str() {
            "manual" => {
                let emails: Vec<String> =
                    serde_json::from_str(&campaign.target_list).unwrap_or_default();
                Ok(emails
                    .into_iter()
                    .filter(|email| !email.is_empty())
                    .map(|email| Recipient {
                        email,
                        name: String::new(),
                    })
                    .collect())
            }
            _ => {
                let contacts = ContactRepository::new(self.db.pool().clone());
                let contacts = contacts.list_active_by_group(campaign.target_group_id).await?;
                Ok(contacts
                    .into_iter()
                    .map(|contact| Recipient {
                        email: contact.email,
                        name: contact.name,
                    })
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use mailforge_storage::{CampaignInput, ChannelInput, ContactGroupRepository};

    struct NullDeliverer;

    #[async_trait]
    impl Deliverer for NullDeliverer {
        async fn send(&self, _req: &SendRequest) -> Result<()> {
            Ok(())
        }
    }

    async fn setup() -> (Database, CampaignEngine<NullDeliverer>) {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();

        let dir = std::env::temp_dir();
        let config = Arc::new(
            ConfigStore::open(dir.join(format!("mailforge-test-{}.json", Uuid::new_v4()))).unwrap(),
        );
        let queue = Arc::new(QueueManager::new(db.clone(), Arc::new(NullDeliverer)));
        let engine = CampaignEngine::new(db.clone(), config, queue);
        (db, engine)
    }

    async fn seed_campaign(db: &Database, target_group_id: i64) -> Campaign {
        let channels = ChannelRepository::new(db.pool().clone());
        let channel = channels
            .create(&ChannelInput {
                name: "relay".to_string(),
                host: "smtp.test".to_string(),
                port: 587,
                username: "sender@x.test".to_string(),
                password: "p".to_string(),
                implicit_tls: false,
                is_default: false,
            })
            .await
            .unwrap();

        let campaigns = CampaignRepository::new(db.pool().clone());
        campaigns
            .create(&CampaignInput {
                name: "launch".to_string(),
                subject: "Hello".to_string(),
                body: r#"<p>Hi {name}</p><a href="http://a.test">here</a></body>"#.to_string(),
                channel_id: channel.id,
                target_type: "group".to_string(),
                target_group_id,
                target_list: String::new(),
                scheduled_at: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_expands_group_and_enqueues_tracked_tasks() {
        let (db, engine) = setup().await;

        let groups = ContactGroupRepository::new(db.pool().clone());
        let group = groups.create("news", "").await.unwrap();
        let contacts = ContactRepository::new(db.pool().clone());
        for (email, name) in [("a@x.test", "Ann"), ("b@x.test", "Bob"), ("c@x.test", "Cay")] {
            contacts.create(email, name, group.id, "").await.unwrap();
        }

        let campaign = seed_campaign(&db, group.id).await;
        let started = engine.start(campaign.id).await.unwrap();
        assert_eq!(started.status, "processing");
        assert_eq!(started.total_count, 3);

        // Fan-out is asynchronous.
        tokio::time::sleep(TokioDuration::from_millis(100)).await;

        let tasks: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT tracking_id, body, campaign_id FROM email_queue ORDER BY id",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(tasks.len(), 3);

        let mut ids: Vec<&String> = tasks.iter().map(|(id, _, _)| id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3, "tracking ids must be distinct");

        for (tracking_id, body, campaign_id) in &tasks {
            assert_eq!(*campaign_id, campaign.id);
            assert!(body.contains(&format!("/api/v1/track/open/{}", tracking_id)));
            assert!(body.contains(&format!("/api/v1/track/click/{}?url=", tracking_id)));
            assert!(body.contains(&format!("/api/v1/track/unsubscribe/{}", tracking_id)));
        }
    }

    #[tokio::test]
    async fn empty_target_fails_campaign() {
        let (db, engine) = setup().await;
        let groups = ContactGroupRepository::new(db.pool().clone());
        let group = groups.create("empty", "").await.unwrap();
        let campaign = seed_campaign(&db, group.id).await;

        let err = engine.start(campaign.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::EmptyRecipients));

        let campaigns = CampaignRepository::new(db.pool().clone());
        assert_eq!(campaigns.get(campaign.id).await.unwrap().unwrap().status, "failed");
    }

    #[tokio::test]
    async fn future_schedule_parks_campaign() {
        let (db, engine) = setup().await;
        let groups = ContactGroupRepository::new(db.pool().clone());
        let group = groups.create("news", "").await.unwrap();
        ContactRepository::new(db.pool().clone())
            .create("a@x.test", "A", group.id, "")
            .await
            .unwrap();

        let campaign = seed_campaign(&db, group.id).await;
        let campaigns = CampaignRepository::new(db.pool().clone());
        sqlx::query("UPDATE campaigns SET scheduled_at = ? WHERE id = ?")
            .bind(chrono::Utc::now() + chrono::Duration::hours(1))
            .bind(campaign.id)
            .execute(db.pool())
            .await
            .unwrap();

        let parked = engine.start(campaign.id).await.unwrap();
        assert_eq!(parked.status, "scheduled");
        assert_eq!(campaigns.get(campaign.id).await.unwrap().unwrap().status, "scheduled");
    }

    #[tokio::test]
    async fn pause_resume_guards() {
        let (db, engine) = setup().await;
        let groups = ContactGroupRepository::new(db.pool().clone());
        let group = groups.create("news", "").await.unwrap();
        let campaign = seed_campaign(&db, group.id).await;

        // Draft cannot pause or resume.
        assert!(matches!(
            engine.pause(campaign.id).await.unwrap_err(),
            CampaignError::NotProcessing
        ));
        assert!(matches!(
            engine.resume(campaign.id).await.unwrap_err(),
            CampaignError::NotPaused
        ));

        let campaigns = CampaignRepository::new(db.pool().clone());
        campaigns.set_status(campaign.id, "processing").await.unwrap();
        assert_eq!(engine.pause(campaign.id).await.unwrap().status, "paused");
        assert_eq!(engine.resume(campaign.id).await.unwrap().status, "processing");
    }

    #[tokio::test]
    async fn test_send_prefixes_subject() {
        let (db, engine) = setup().await;
        let groups = ContactGroupRepository::new(db.pool().clone());
        let group = groups.create("news", "").await.unwrap();
        let campaign = seed_campaign(&db, group.id).await;

        let queue_id = engine.test_send(campaign.id, "probe@y.test").await.unwrap();

        let (subject, body, campaign_id): (String, String, i64) = sqlx::query_as(
            "SELECT subject, body, campaign_id FROM email_queue WHERE id = ?",
        )
        .bind(queue_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(subject, "[Test] Hello");
        assert!(body.contains("Hi Test User"));
        assert_eq!(campaign_id, 0);
    }
}
