//! A pool worker process: consumes from exactly one pool's queue (`cpu` or
//! `gpu`) and runs whichever stage each dispatched message names (spec.md
//! §4.3, §5.2). One process per pool, one stage at a time; multiple
//! instances of this binary against the same pool is how that fleet scales
//! horizontally.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use sdcloud_config::Settings;
use sdcloud_core::Pool;
use sdcloud_executor::DockerContainerRunner;
use sdcloud_pipeline::default_registry;
use sdcloud_scheduler::{Broker, LapinRedisBroker, PoolWorker};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Which pool this process serves: the first CLI argument, falling back to
/// the `SDCLOUD_POOL` environment variable.
fn requested_pool() -> anyhow::Result<Pool> {
    let raw = env::args()
        .nth(1)
        .or_else(|| env::var("SDCLOUD_POOL").ok())
        .context("usage: sdcloud-worker <cpu|gpu> (or set SDCLOUD_POOL)")?;
    raw.parse::<Pool>()
        .map_err(|e| anyhow::anyhow!("invalid pool {raw:?}: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = requested_pool()?;
    let settings = Settings::from_env().context("loading settings")?;
    info!(env = ?settings.env, %pool, "starting sdcloud-worker");

    let broker: Arc<dyn Broker> = Arc::new(
        LapinRedisBroker::connect(&settings.rabbitmq_url, &settings.redis_url)
            .await
            .context("connecting to the broker")?,
    );
    let store = sdcloud_storage::build_store(&settings).context("building object store")?;
    let runner = Arc::new(DockerContainerRunner::new().context("connecting to docker")?);
    let registry = Arc::new(default_registry());

    let worker = PoolWorker::new(
        pool,
        broker,
        registry,
        runner,
        store,
        settings.tmp_dir.clone().into(),
        settings.queue_image_tag.clone(),
        settings.image_registry.clone(),
    );

    info!(%pool, "worker loop running");
    worker.run().await
}
