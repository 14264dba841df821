//! Application state.
//!
//! Grounded on `buildit_api::state::AppState`'s "one `Arc` per collaborator,
//! constructed once at startup" shape, with the executor-selection pattern
//! (`ExecutorType::from_env`) generalized to the broker and blob store this
//! service needs instead of a Kubernetes/Docker choice.

use std::path::PathBuf;
use std::sync::Arc;

use object_store::ObjectStore;
use sdcloud_config::Settings;
use sdcloud_core::Result;
use sdcloud_db::JobRepo;
use sdcloud_scheduler::Broker;

/// Shared application state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub job_repo: Arc<dyn JobRepo>,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ObjectStore>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        job_repo: Arc<dyn JobRepo>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        settings: Settings,
    ) -> Self {
        Self {
            job_repo,
            broker,
            store,
            settings: Arc::new(settings),
        }
    }

    pub fn tmp_dir(&self) -> PathBuf {
        PathBuf::from(&self.settings.tmp_dir)
    }

    /// Build the real Postgres/Lapin+Redis/object_store-backed state from
    /// settings, the way `AppState::init_executor` wires a concrete executor
    /// in the teacher.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let pool = sdcloud_db::create_pool(&settings.database_url)
            .await
            .map_err(sdcloud_core::Error::from)?;
        sdcloud_db::run_migrations(&pool)
            .await
            .map_err(sdcloud_core::Error::from)?;
        let job_repo: Arc<dyn JobRepo> = Arc::new(sdcloud_db::PgJobRepo::new(pool));

        let broker: Arc<dyn Broker> = Arc::new(
            sdcloud_scheduler::LapinRedisBroker::connect(&settings.rabbitmq_url, &settings.redis_url)
                .await?,
        );

        let store = sdcloud_storage::build_store(&settings)?;

        Ok(Self::new(job_repo, broker, store, settings))
    }
}
