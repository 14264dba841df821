//! The scheduler process: runs the promoter, poller, and reaper loops side
//! by side, each as its own coalescing `tokio` task (spec.md §4.7, §5.1).
//!
//! This is deliberately the only thing this binary does — it never touches
//! a container or the shared archive directly, only the job table and the
//! broker, matching spec.md's "scheduler process communicates only through
//! durable state and the message broker" model.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sdcloud_config::Settings;
use sdcloud_db::PgJobRepo;
use sdcloud_scheduler::{Broker, LapinRedisBroker, poller_tick, promoter_tick, reaper_tick, spawn_periodic};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Promoter and poller both run on this interval (spec.md §4.7: "every ~2s").
const LOOP_INTERVAL: Duration = Duration::from_secs(2);

/// Reaper runs on this interval (spec.md §4.7: "every ~2h").
const REAPER_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env().context("loading settings")?;
    info!(env = ?settings.env, "starting sdcloud-scheduler");

    let pool = sdcloud_db::create_pool(&settings.database_url)
        .await
        .context("connecting to the job database")?;
    sdcloud_db::run_migrations(&pool)
        .await
        .context("running database migrations")?;
    let repo = Arc::new(PgJobRepo::new(pool));

    let broker: Arc<dyn Broker> = Arc::new(
        LapinRedisBroker::connect(&settings.rabbitmq_url, &settings.redis_url)
            .await
            .context("connecting to the broker")?,
    );

    // Reaper runs once immediately at startup in addition to its periodic
    // schedule (spec.md §4.7).
    info!("running startup reaper pass");
    if let Err(e) = reaper_tick(Arc::clone(&repo)).await {
        tracing::error!(error = %e, "startup reaper pass failed");
    }

    let promoter_repo = Arc::clone(&repo);
    let promoter_broker = Arc::clone(&broker);
    let promoter_handle = spawn_periodic(LOOP_INTERVAL, "promoter", move || {
        promoter_tick(Arc::clone(&promoter_repo), Arc::clone(&promoter_broker))
    });

    let poller_repo = Arc::clone(&repo);
    let poller_broker = Arc::clone(&broker);
    let poller_handle = spawn_periodic(LOOP_INTERVAL, "poller", move || {
        poller_tick(Arc::clone(&poller_repo), Arc::clone(&poller_broker))
    });

    let reaper_repo = Arc::clone(&repo);
    let reaper_handle = spawn_periodic(REAPER_INTERVAL, "reaper", move || {
        reaper_tick(Arc::clone(&reaper_repo))
    });

    info!("scheduler loops running");
    tokio::signal::ctrl_c().await.context("awaiting shutdown signal")?;
    info!("shutdown signal received, stopping loops");

    promoter_handle.abort();
    poller_handle.abort();
    reaper_handle.abort();

    Ok(())
}
