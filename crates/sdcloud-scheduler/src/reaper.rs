//! Deletes old job rows past their retention window.
//!
//! Grounded on the original's nightly cleanup job (`delete_old_jobs`):
//! spec.md §4.7 deletes rows whose `status != SCHEDULED` and that are older
//! than the retention threshold — not only the terminal statuses. A
//! `QUEUED` or `RUNNING` row stuck past retention (e.g. a worker that died
//! mid-stage) is just as reapable as a `FAILED` one; only `SCHEDULED` is
//! exempt, since that's the status a job sits in between dispatches.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use sdcloud_core::Result;
use sdcloud_db::JobRepo;
use tracing::info;

/// How long a reapable row is kept before the reaper deletes it.
pub const DEFAULT_RETENTION: StdDuration = StdDuration::from_secs(3 * 24 * 60 * 60);

pub async fn run_reaper_tick(repo: &dyn JobRepo, retention: StdDuration) -> Result<()> {
    let older_than = Utc::now()
        - chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
    let deleted = repo.delete_reapable_before(older_than).await?;
    if deleted > 0 {
        info!(deleted, "reaped old job rows");
    }
    Ok(())
}

pub async fn reaper_tick(repo: Arc<dyn JobRepo>) -> Result<()> {
    run_reaper_tick(repo.as_ref(), DEFAULT_RETENTION).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdcloud_core::{Job, JobStatus, StageId};
    use sdcloud_db::test_support::InMemoryJobRepo;

    fn steps() -> Vec<StageId> {
        vec!["cpu.prestage_0".parse().unwrap()]
    }

    #[tokio::test]
    async fn old_failed_jobs_are_deleted_but_recent_scheduled_ones_are_not() {
        let repo = InMemoryJobRepo::new();

        let mut old_failed = Job::new(steps(), serde_json::json!({}));
        old_failed.created_at = Utc::now() - chrono::Duration::days(10);
        old_failed.status = JobStatus::Failed;
        let old_failed_id = old_failed.id;
        repo.create(&old_failed).await.unwrap();

        let mut recent_scheduled = Job::new(steps(), serde_json::json!({}));
        recent_scheduled.status = JobStatus::Scheduled;
        recent_scheduled.task_ids.push("task-1".into());
        recent_scheduled.current_step = recent_scheduled.step_at(0).cloned();
        let recent_scheduled_id = recent_scheduled.id;
        repo.create(&recent_scheduled).await.unwrap();

        run_reaper_tick(&repo, DEFAULT_RETENTION).await.unwrap();

        assert!(repo.get(old_failed_id).await.is_err());
        assert!(repo.get(recent_scheduled_id).await.is_ok());
    }

    #[tokio::test]
    async fn old_queued_and_running_rows_are_reaped_too() {
        let repo = InMemoryJobRepo::new();

        let mut old_queued = Job::new(steps(), serde_json::json!({}));
        old_queued.created_at = Utc::now() - chrono::Duration::days(10);
        let old_queued_id = old_queued.id;
        repo.create(&old_queued).await.unwrap();

        let mut old_running = Job::new(steps(), serde_json::json!({}));
        old_running.created_at = Utc::now() - chrono::Duration::days(10);
        old_running.status = JobStatus::Running;
        old_running.task_ids.push("task-1".into());
        old_running.current_step = old_running.step_at(0).cloned();
        let old_running_id = old_running.id;
        repo.create(&old_running).await.unwrap();

        run_reaper_tick(&repo, DEFAULT_RETENTION).await.unwrap();

        assert!(repo.get(old_queued_id).await.is_err());
        assert!(repo.get(old_running_id).await.is_err());
    }

    #[tokio::test]
    async fn failed_row_created_at_t0_is_reaped_by_t_plus_4_days() {
        let repo = InMemoryJobRepo::new();

        let mut job = Job::new(steps(), serde_json::json!({}));
        job.created_at = Utc::now() - chrono::Duration::days(4);
        job.status = JobStatus::Failed;
        let job_id = job.id;
        repo.create(&job).await.unwrap();

        run_reaper_tick(&repo, DEFAULT_RETENTION).await.unwrap();

        assert!(repo.get(job_id).await.is_err());
    }
}
