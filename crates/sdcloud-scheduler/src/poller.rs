//! Polls in-flight jobs' broker state and advances or fails them.
//!
//! Grounded on the original's result-backend polling job: for every
//! `SCHEDULED`/`RUNNING` row, read back the last dispatched task's state and
//! react. `STARTED` flips the job to `RUNNING`; `SUCCESS` dispatches the next
//! step (or finishes the job if there isn't one) and forgets the result;
//! `FAILURE` fails the job with the reported traceback. `PENDING` is a
//! no-op — the job just hasn't been picked up by a pool worker yet.

use std::sync::Arc;

use sdcloud_core::Result;
use sdcloud_db::JobRepo;
use tracing::{error, info, warn};

use crate::broker::{Broker, TaskState};
use crate::dispatch::dispatch_step_at;

pub const DEFAULT_POLL_BATCH: i64 = 50;

pub async fn run_poller_tick(repo: &dyn JobRepo, broker: &dyn Broker, batch: i64) -> Result<()> {
    let in_flight = repo.list_in_flight(batch).await?;
    if in_flight.is_empty() {
        return Ok(());
    }

    for mut job in in_flight {
        let Some(task_id) = job.task_ids.last().cloned() else {
            warn!(job_id = %job.id, "in-flight job has no dispatched task, skipping");
            continue;
        };

        let state = match broker.poll(&task_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(job_id = %job.id, %task_id, error = %e, "polling broker failed, will retry next tick");
                continue;
            }
        };

        match state {
            TaskState::Pending => continue,
            TaskState::Started => {
                job.mark_running();
                repo.update(&job).await?;
            }
            TaskState::Success => {
                let _ = broker.forget(&task_id).await;
                let next_progress = job.progress + 1;
                if next_progress >= job.total {
                    job.advance(None);
                    info!(job_id = %job.id, "job succeeded");
                    repo.update(&job).await?;
                } else {
                    match dispatch_step_at(&job, next_progress, broker).await {
                        Ok(next_task_id) => {
                            job.advance(Some(next_task_id));
                            repo.update(&job).await?;
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "dispatch failed advancing job, failing it");
                            job.fail(format!("dispatch failed: {e}"));
                            if let Err(update_err) = repo.update(&job).await {
                                error!(job_id = %job.id, error = %update_err, "failed to persist job failure");
                            }
                        }
                    }
                }
            }
            TaskState::Failure { traceback } => {
                let _ = broker.forget(&task_id).await;
                warn!(job_id = %job.id, "stage failed");
                job.fail(traceback);
                repo.update(&job).await?;
            }
        }
    }
    Ok(())
}

pub async fn poller_tick(repo: Arc<dyn JobRepo>, broker: Arc<dyn Broker>) -> Result<()> {
    run_poller_tick(repo.as_ref(), broker.as_ref(), DEFAULT_POLL_BATCH).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use sdcloud_core::{Job, JobStatus, StageId};
    use sdcloud_db::test_support::InMemoryJobRepo;

    fn steps() -> Vec<StageId> {
        vec![
            "cpu.prestage_0".parse().unwrap(),
            "cpu.stage_0".parse().unwrap(),
        ]
    }

    async fn scheduled_job(repo: &InMemoryJobRepo, broker: &InMemoryBroker) -> sdcloud_core::JobId {
        let mut job = Job::new(steps(), serde_json::json!({}));
        let task_id = dispatch_step_at(&job, 0, broker).await.unwrap();
        job.schedule(task_id);
        let id = job.id;
        repo.create(&job).await.unwrap();
        id
    }

    #[tokio::test]
    async fn started_task_flips_job_to_running() {
        let repo = InMemoryJobRepo::new();
        let broker = InMemoryBroker::new();
        let job_id = scheduled_job(&repo, &broker).await;
        let task_id = repo.get(job_id).await.unwrap().task_ids[0].clone();
        broker.report_started(&task_id).await.unwrap();

        run_poller_tick(&repo, &broker, 10).await.unwrap();

        assert_eq!(repo.get(job_id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn success_on_last_step_completes_the_job() {
        let repo = InMemoryJobRepo::new();
        let broker = InMemoryBroker::new();
        let mut job = Job::new(vec!["cpu.prestage_0".parse().unwrap()], serde_json::json!({}));
        let task_id = dispatch_step_at(&job, 0, &broker).await.unwrap();
        job.schedule(task_id.clone());
        let job_id = job.id;
        repo.create(&job).await.unwrap();
        broker.report_success(&task_id).await.unwrap();

        run_poller_tick(&repo, &broker, 10).await.unwrap();

        let stored = repo.get(job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.progress, stored.total);
    }

    #[tokio::test]
    async fn success_on_a_middle_step_dispatches_the_next_one() {
        let repo = InMemoryJobRepo::new();
        let broker = InMemoryBroker::new();
        let job_id = scheduled_job(&repo, &broker).await;
        let task_id = repo.get(job_id).await.unwrap().task_ids[0].clone();
        broker.report_success(&task_id).await.unwrap();

        run_poller_tick(&repo, &broker, 10).await.unwrap();

        let stored = repo.get(job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.progress, 1);
        assert_eq!(stored.task_ids.len(), 2);
    }

    #[tokio::test]
    async fn failure_fails_the_job_with_the_traceback() {
        let repo = InMemoryJobRepo::new();
        let broker = InMemoryBroker::new();
        let job_id = scheduled_job(&repo, &broker).await;
        let task_id = repo.get(job_id).await.unwrap().task_ids[0].clone();
        broker
            .report_failure(&task_id, "Traceback: boom".to_string())
            .await
            .unwrap();

        run_poller_tick(&repo, &broker, 10).await.unwrap();

        let stored = repo.get(job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.logs.as_deref(), Some("Traceback: boom"));
    }

    #[tokio::test]
    async fn pending_task_leaves_job_untouched() {
        let repo = InMemoryJobRepo::new();
        let broker = InMemoryBroker::new();
        let job_id = scheduled_job(&repo, &broker).await;

        run_poller_tick(&repo, &broker, 10).await.unwrap();

        assert_eq!(repo.get(job_id).await.unwrap().status, JobStatus::Scheduled);
    }
}
