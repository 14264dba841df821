//! Pool worker: pulls task messages off a single pool's queue and runs the
//! matching stage.
//!
//! Grounded on the original's per-pool Celery worker process (`celery -Q
//! cpu` / `celery -Q gpu`): one [`PoolWorker`] owns exactly one
//! [`sdcloud_core::Pool`]'s queue and loops pulling, executing, and
//! reporting outcomes back through the broker. The actual stage logic lives
//! in [`sdcloud_pipeline`]; this module only wires a dispatched message to a
//! registry lookup and a [`StageExecutionContext`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use object_store::ObjectStore;
use sdcloud_core::{Error, JobId, Pool, Result, StageId};
use sdcloud_executor::ContainerRunner;
use sdcloud_pipeline::{StageExecutionContext, StageRegistry};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broker::{Broker, TaskMessage};

/// How long a worker sleeps after finding an empty queue before polling
/// again.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How often a running task's revocation flag is re-checked while its
/// container is still executing.
pub const REVOKE_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct PoolWorker {
    pool: Pool,
    broker: Arc<dyn Broker>,
    registry: Arc<StageRegistry>,
    runner: Arc<dyn ContainerRunner>,
    store: Arc<dyn ObjectStore>,
    tmp_dir: PathBuf,
    queue_image_tag: String,
    image_registry: String,
}

impl PoolWorker {
    pub fn new(
        pool: Pool,
        broker: Arc<dyn Broker>,
        registry: Arc<StageRegistry>,
        runner: Arc<dyn ContainerRunner>,
        store: Arc<dyn ObjectStore>,
        tmp_dir: PathBuf,
        queue_image_tag: String,
        image_registry: String,
    ) -> Self {
        Self {
            pool,
            broker,
            registry,
            runner,
            store,
            tmp_dir,
            queue_image_tag,
            image_registry,
        }
    }

    /// Run forever, sleeping between empty polls.
    pub async fn run(&self) -> ! {
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
                Err(e) => {
                    warn!(pool = %self.pool, error = %e, "worker tick failed, backing off");
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Pull and run at most one task. Returns `false` if the queue was
    /// empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(message) = self.broker.next_message(self.pool).await? else {
            return Ok(false);
        };
        self.execute(message).await?;
        Ok(true)
    }

    async fn execute(&self, message: TaskMessage) -> Result<()> {
        if self.broker.is_revoked(&message.task_id).await? {
            info!(task_id = %message.task_id, "skipping revoked task");
            return Ok(());
        }
        self.broker.report_started(&message.task_id).await?;

        // `is_revoked` above only catches cancellation before the container
        // starts. A cancel can also arrive while the container is running
        // (spec: cancelling a job must kill its `stage.pool.cmd-<task_id>`
        // container, not just stop new tasks from starting), so this polls
        // the broker for the duration of the run and force-removes the
        // container the moment revocation is observed.
        let container_name = self.revoked_container_name(&message);
        let stop_watch = Arc::new(AtomicBool::new(false));
        let watcher = {
            let broker = Arc::clone(&self.broker);
            let runner = Arc::clone(&self.runner);
            let task_id = message.task_id.clone();
            let stop_watch = Arc::clone(&stop_watch);
            tokio::spawn(async move {
                while !stop_watch.load(Ordering::Relaxed) {
                    tokio::time::sleep(REVOKE_POLL_INTERVAL).await;
                    if stop_watch.load(Ordering::Relaxed) {
                        break;
                    }
                    match broker.is_revoked(&task_id).await {
                        Ok(true) => {
                            if let Some(name) = &container_name {
                                warn!(%task_id, container = %name, "task revoked mid-run, killing container");
                                let _ = runner.kill_container(name).await;
                            }
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => warn!(%task_id, error = %e, "revocation poll failed"),
                    }
                }
            })
        };

        let outcome = self.run_stage(&message).await;
        stop_watch.store(true, Ordering::Relaxed);
        watcher.abort();

        match outcome {
            Ok(()) => self.broker.report_success(&message.task_id).await,
            Err(e) => {
                warn!(task_id = %message.task_id, error = %e, "stage execution failed");
                self.broker.report_failure(&message.task_id, e.to_string()).await
            }
        }
    }

    /// The deterministic name the stage's container will run under, matching
    /// [`sdcloud_executor::ContainerSpec::container_name`] (`{stage
    /// name}-{task_id}`). `None` if the stage name can't be parsed, in which
    /// case `run_stage` will fail on its own and there's no container to
    /// kill anyway.
    fn revoked_container_name(&self, message: &TaskMessage) -> Option<String> {
        let stage_id: StageId = message.stage_name.parse().ok()?;
        Some(format!("{}-{}", stage_id.name(), message.task_id))
    }

    async fn run_stage(&self, message: &TaskMessage) -> Result<()> {
        let stage_id: StageId = message.stage_name.parse()?;
        let job_id: JobId = message
            .payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Internal("task message missing job_id".to_string()))?;
        let submission = message
            .payload
            .get("payload")
            .cloned()
            .unwrap_or(Value::Null);

        let stage = self.registry.get(&stage_id)?;
        let job_dir = sdcloud_storage::get_tmp_dir(&self.tmp_dir, job_id)?;

        let ectx = StageExecutionContext {
            job_id,
            task_id: message.task_id.clone(),
            job_dir,
            queue_image_tag: self.queue_image_tag.clone(),
            image_registry: self.image_registry.clone(),
            runner: Arc::clone(&self.runner),
            store: Arc::clone(&self.store),
        };

        debug!(%job_id, stage = %stage_id, "running stage");
        stage.run(&ectx, Value::Null, &submission).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use object_store::memory::InMemory;
    use sdcloud_core::StageOutcome;
    use sdcloud_executor::ContainerSpec;

    struct AlwaysSucceeds;

    #[async_trait::async_trait]
    impl ContainerRunner for AlwaysSucceeds {
        async fn run_container(&self, _spec: &ContainerSpec) -> Result<StageOutcome> {
            Ok(StageOutcome::Success { log: "ok".to_string() })
        }

        async fn kill_container(&self, _container_name: &str) -> Result<()> {
            Ok(())
        }
    }

    struct KillTracking {
        killed: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
        run_started: std::sync::Arc<tokio::sync::Notify>,
        release: std::sync::Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl ContainerRunner for KillTracking {
        async fn run_container(&self, _spec: &ContainerSpec) -> Result<StageOutcome> {
            self.run_started.notify_one();
            self.release.notified().await;
            Ok(StageOutcome::Success { log: "ok".to_string() })
        }

        async fn kill_container(&self, container_name: &str) -> Result<()> {
            self.killed.lock().unwrap().push(container_name.to_string());
            self.release.notify_one();
            Ok(())
        }
    }

    struct BlockingStage {
        id: StageId,
    }

    impl BlockingStage {
        fn new(id: &str) -> Self {
            Self { id: id.parse().unwrap() }
        }
    }

    #[async_trait::async_trait]
    impl sdcloud_pipeline::StageTask for BlockingStage {
        fn id(&self) -> &StageId {
            &self.id
        }

        async fn run(
            &self,
            ectx: &StageExecutionContext,
            context: Value,
            _payload: &Value,
        ) -> Result<Value> {
            let spec = ContainerSpec {
                task_function: self.id.name().to_string(),
                task_id: ectx.task_id.clone(),
                image: "test/image".to_string(),
                command: "noop".to_string(),
                input_dir: ectx.input_dir(),
                output_dir: ectx.output_dir(),
                output_alias_path: "/workdir/output".to_string(),
                gpu: false,
            };
            match ectx.runner.run_container(&spec).await? {
                StageOutcome::Success { .. } => Ok(context),
                StageOutcome::Fatal { log, .. } => Err(Error::StageFailed(log)),
            }
        }
    }

    fn worker(broker: Arc<dyn Broker>, tmp: &tempfile::TempDir) -> PoolWorker {
        PoolWorker::new(
            Pool::Cpu,
            broker,
            Arc::new(sdcloud_pipeline::default_registry()),
            Arc::new(AlwaysSucceeds),
            Arc::new(InMemory::new()),
            tmp.path().to_path_buf(),
            "stable".to_string(),
            "registry.example.com/sdcloud".to_string(),
        )
    }

    #[tokio::test]
    async fn empty_queue_returns_false() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let tmp = tempfile::tempdir().unwrap();
        let w = worker(broker, &tmp);
        assert!(!w.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn unknown_stage_name_reports_failure_not_a_crash() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let tmp = tempfile::tempdir().unwrap();
        let w = worker(Arc::clone(&broker), &tmp);

        let task_id = broker
            .delay(Pool::Cpu, "cpu.not_a_real_stage", serde_json::json!({"job_id": JobId::new().to_string()}))
            .await
            .unwrap();

        assert!(w.run_once().await.unwrap());
        match broker.poll(&task_id).await.unwrap() {
            crate::broker::TaskState::Failure { .. } => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoked_task_is_skipped_without_running() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let tmp = tempfile::tempdir().unwrap();
        let w = worker(Arc::clone(&broker), &tmp);

        let task_id = broker
            .delay(Pool::Cpu, "cpu.cleanup", serde_json::json!({"job_id": JobId::new().to_string()}))
            .await
            .unwrap();
        broker.revoke(&task_id).await.unwrap();

        assert!(w.run_once().await.unwrap());
        assert_eq!(broker.poll(&task_id).await.unwrap(), crate::broker::TaskState::Pending);
    }

    #[tokio::test]
    async fn revoking_a_task_mid_run_kills_its_container() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let tmp = tempfile::tempdir().unwrap();

        let killed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let run_started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let runner: Arc<dyn ContainerRunner> = Arc::new(KillTracking {
            killed: Arc::clone(&killed),
            run_started: Arc::clone(&run_started),
            release: Arc::clone(&release),
        });

        let mut registry = sdcloud_pipeline::StageRegistry::new();
        registry.register(Arc::new(BlockingStage::new("cpu.stage_0")));

        let w = PoolWorker::new(
            Pool::Cpu,
            Arc::clone(&broker),
            Arc::new(registry),
            runner,
            Arc::new(InMemory::new()),
            tmp.path().to_path_buf(),
            "stable".to_string(),
            "registry.example.com/sdcloud".to_string(),
        );

        let task_id = broker
            .delay(Pool::Cpu, "cpu.stage_0", serde_json::json!({"job_id": JobId::new().to_string()}))
            .await
            .unwrap();
        let expected_container = format!("stage_0-{task_id}");

        let run = tokio::spawn(async move { w.run_once().await });

        run_started.notified().await;
        broker.revoke(&task_id).await.unwrap();

        assert!(run.await.unwrap().unwrap());
        assert_eq!(killed.lock().unwrap().as_slice(), [expected_container]);
    }
}
