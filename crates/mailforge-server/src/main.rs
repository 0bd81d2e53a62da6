//! Mailforge - self-hosted email delivery platform entry point

use anyhow::Result;
use mailforge_api::auth::CaptchaStore;
use mailforge_api::AppState;
use mailforge_common::ConfigStore;
use mailforge_core::{
    CampaignEngine, CleanupRunner, DeliveryEngine, QueueManager, Scheduler, SmtpIngress,
};
use mailforge_storage::db::{generate_initial_password, hash_password};
use mailforge_storage::{AttachmentStore, Database, UserRepository};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONFIG_PATH: &str = "config.json";
const DATABASE_PATH: &str = "mailforge.db";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let reset_password = args.iter().any(|a| a == "-reset");
    let reset_totp = args.iter().any(|a| a == "-reset-totp");

    info!("Starting Mailforge...");

    let config = Arc::new(ConfigStore::open(CONFIG_PATH)?);

    let db = Database::connect(DATABASE_PATH).await?;
    db.init().await?;

    if reset_password || reset_totp {
        run_reset(&db, reset_password, reset_totp).await?;
        return Ok(());
    }

    let files = AttachmentStore::new(".");

    // Engine layer.
    let engine = Arc::new(DeliveryEngine::new(db.clone(), config.clone(), files.clone()));
    let queue = Arc::new(QueueManager::new(db.clone(), engine));
    let campaigns = Arc::new(CampaignEngine::new(db.clone(), config.clone(), queue.clone()));
    let cleanup = Arc::new(CleanupRunner::new(db.clone(), files.clone()));

    // Queue worker.
    let queue_handle = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue.run().await;
        })
    };

    // Scheduler: campaign promotion plus nightly cleanup.
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        config.clone(),
        campaigns.clone(),
        cleanup.clone(),
    ));
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run().await;
    });

    // SMTP ingress.
    let ingress = Arc::new(SmtpIngress::new(
        db.clone(),
        config.clone(),
        files.clone(),
        queue.clone(),
    ));
    let ingress_handle = tokio::spawn(async move {
        if let Err(e) = ingress.run().await {
            error!(error = %e, "SMTP receiver failed");
        }
    });

    // HTTP API.
    let state = AppState {
        db,
        config: config.clone(),
        files,
        queue,
        campaigns,
        cleanup,
        captcha: Arc::new(CaptchaStore::new()),
    };
    let snapshot = config.snapshot();
    if snapshot.enable_ssl {
        // Certificate issuance and TLS termination for the API live in
        // front of the process (reverse proxy / certificate manager).
        info!("enable_ssl is set; expecting TLS termination in front of the API");
    }
    let addr = format!("{}:{}", snapshot.host, snapshot.port);
    let app = mailforge_api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "API server listening");

    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("Mailforge started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    api_handle.abort();
    ingress_handle.abort();
    scheduler_handle.abort();
    queue_handle.abort();

    info!("Mailforge shutdown complete");
    Ok(())
}

/// CLI recovery flags: regenerate the admin password and/or clear TOTP.
async fn run_reset(db: &Database, reset_password: bool, reset_totp: bool) -> Result<()> {
    let users = UserRepository::new(db.pool().clone());
    let admin = users
        .find_by_username("admin")
        .await?
        .ok_or_else(|| anyhow::anyhow!("admin user not found"))?;

    if reset_password {
        let password = generate_initial_password();
        let hash = hash_password(&password)?;
        users.update_password(admin.id, &hash).await?;
        info!("╔══════════════════════════════════════════════╗");
        info!("║  New admin password: {:<23} ║", password);
        info!("╚══════════════════════════════════════════════╝");
    }

    if reset_totp {
        users.reset_totp("admin").await?;
        info!("TOTP has been cleared for admin");
    }

    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mailforge=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
