//! In-memory [`JobRepo`] fake for scheduler and API tests. Not wired to any
//! real storage; exists purely so control-loop tests don't need a Postgres
//! instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdcloud_core::{Job, JobId, JobStatus};

use crate::{DbError, DbResult};
use crate::repo::job::JobRepo;

#[derive(Default)]
pub struct InMemoryJobRepo {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepo for InMemoryJobRepo {
    async fn create(&self, job: &Job) -> DbResult<()> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    async fn update(&self, job: &Job) -> DbResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(DbError::NotFound(format!("job {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_queued(&self, limit: i64) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut queued: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|j| j.created_at);
        queued.truncate(limit.max(0) as usize);
        Ok(queued)
    }

    async fn list_in_flight(&self, limit: i64) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut in_flight: Vec<Job> = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Scheduled | JobStatus::Running))
            .cloned()
            .collect();
        in_flight.sort_by_key(|j| j.created_at);
        in_flight.truncate(limit.max(0) as usize);
        Ok(in_flight)
    }

    async fn delete_reapable_before(&self, older_than: DateTime<Utc>) -> DbResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status != JobStatus::Scheduled && j.created_at < older_than));
        Ok((before - jobs.len()) as u64)
    }
}
