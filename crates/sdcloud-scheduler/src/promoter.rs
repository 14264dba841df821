//! Promotes `QUEUED` jobs to `SCHEDULED` by dispatching their first step.
//!
//! Grounded on the original's APScheduler-driven promotion job: pull a
//! batch of queued rows, hand each to the broker, and record the result.
//! A dispatch failure here is itself fatal to the job (spec.md scenario 3:
//! broker unreachable when promoting fails the job outright rather than
//! leaving it stuck `QUEUED` forever).

use std::sync::Arc;

use sdcloud_core::Result;
use sdcloud_db::JobRepo;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::dispatch::dispatch_step_at;

/// Default batch size pulled from `list_queued` each tick.
pub const DEFAULT_PROMOTE_BATCH: i64 = 20;

/// Run one promotion pass: look at every `QUEUED` job (oldest first, capped
/// at `batch`) and dispatch its first step.
pub async fn run_promoter_tick(
    repo: &dyn JobRepo,
    broker: &dyn Broker,
    batch: i64,
) -> Result<()> {
    let queued = repo.list_queued(batch).await?;
    if queued.is_empty() {
        return Ok(());
    }
    info!(count = queued.len(), "promoting queued jobs");

    for mut job in queued {
        match dispatch_step_at(&job, 0, broker).await {
            Ok(task_id) => {
                job.schedule(task_id);
                repo.update(&job).await?;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "dispatch failed while promoting, failing job");
                job.fail(format!("dispatch failed: {e}"));
                if let Err(update_err) = repo.update(&job).await {
                    error!(job_id = %job.id, error = %update_err, "failed to persist job failure");
                }
            }
        }
    }
    Ok(())
}

/// Convenience wrapper for wiring into [`crate::loops::spawn_periodic`].
pub async fn promoter_tick(repo: Arc<dyn JobRepo>, broker: Arc<dyn Broker>) -> Result<()> {
    run_promoter_tick(repo.as_ref(), broker.as_ref(), DEFAULT_PROMOTE_BATCH).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use sdcloud_core::{Job, JobStatus, StageId};
    use sdcloud_db::test_support::InMemoryJobRepo;

    fn steps() -> Vec<StageId> {
        vec!["cpu.prestage_0".parse().unwrap(), "cpu.cleanup".parse().unwrap()]
    }

    #[tokio::test]
    async fn queued_job_is_dispatched_and_becomes_scheduled() {
        let repo = InMemoryJobRepo::new();
        let broker = InMemoryBroker::new();
        let job = Job::new(steps(), serde_json::json!({"pos_prompt": "a chair"}));
        let job_id = job.id;
        repo.create(&job).await.unwrap();

        run_promoter_tick(&repo, &broker, 10).await.unwrap();

        let stored = repo.get(job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.task_ids.len(), 1);
    }

    #[tokio::test]
    async fn empty_queue_is_a_noop() {
        let repo = InMemoryJobRepo::new();
        let broker = InMemoryBroker::new();
        run_promoter_tick(&repo, &broker, 10).await.unwrap();
    }
}
