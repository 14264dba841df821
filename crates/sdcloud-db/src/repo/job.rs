//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdcloud_core::{Job, JobId, JobStatus, StageId};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::{DbError, DbResult};

/// Row shape for the `jobs` table. `steps` and `task_ids` are stored as
/// `jsonb`; `current_step` is the stage id's dotted string form so a plain
/// index can filter on it.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    created_at: DateTime<Utc>,
    status: String,
    steps: Json<Vec<StageId>>,
    total: i32,
    progress: i32,
    current_step: Option<String>,
    task_ids: Json<Vec<String>>,
    payload: serde_json::Value,
    logs: Option<String>,
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "QUEUED",
        JobStatus::Scheduled => "SCHEDULED",
        JobStatus::Running => "RUNNING",
        JobStatus::Succeeded => "SUCCEEDED",
        JobStatus::Failed => "FAILED",
        JobStatus::Cancelled => "CANCELLED",
    }
}

fn status_from_str(s: &str) -> DbResult<JobStatus> {
    Ok(match s {
        "QUEUED" => JobStatus::Queued,
        "SCHEDULED" => JobStatus::Scheduled,
        "RUNNING" => JobStatus::Running,
        "SUCCEEDED" => JobStatus::Succeeded,
        "FAILED" => JobStatus::Failed,
        "CANCELLED" => JobStatus::Cancelled,
        other => return Err(DbError::NotFound(format!("unknown job status: {other}"))),
    })
}

impl JobRow {
    fn into_job(self) -> DbResult<Job> {
        let current_step = self
            .current_step
            .map(|s| {
                s.parse::<StageId>()
                    .map_err(|e| DbError::NotFound(format!("malformed current_step: {e}")))
            })
            .transpose()?;
        Ok(Job {
            id: JobId::from_uuid(self.id),
            created_at: self.created_at,
            status: status_from_str(&self.status)?,
            steps: self.steps.0,
            total: self.total,
            progress: self.progress,
            current_step,
            task_ids: self.task_ids.0,
            payload: self.payload,
            logs: self.logs,
        })
    }
}

/// Persists [`Job`] rows and the handful of queries the scheduler and API
/// surfaces need: fetch by id, the set of jobs still eligible to be
/// promoted or polled, and a bulk delete for the reaper.
#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn create(&self, job: &Job) -> DbResult<()>;
    async fn get(&self, id: JobId) -> DbResult<Job>;
    async fn update(&self, job: &Job) -> DbResult<()>;

    /// Jobs still `QUEUED`, oldest first — candidates for the promoter loop.
    async fn list_queued(&self, limit: i64) -> DbResult<Vec<Job>>;

    /// Jobs currently `SCHEDULED` or `RUNNING` — candidates for the poller
    /// loop.
    async fn list_in_flight(&self, limit: i64) -> DbResult<Vec<Job>>;

    /// Delete every row that isn't `SCHEDULED` and is older than
    /// `older_than` (spec.md §4.7: `status != SCHEDULED AND created_at <
    /// now - retention`). This reaps `QUEUED` and `RUNNING` rows too, not
    /// just the terminal ones — a stuck `QUEUED`/`RUNNING` row is still
    /// stale past retention even though it never reached a terminal state.
    /// Returns the number of rows removed.
    async fn delete_reapable_before(&self, older_than: DateTime<Utc>) -> DbResult<u64>;
}

pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn create(&self, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, created_at, status, steps, total, progress,
                current_step, task_ids, payload, logs
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.created_at)
        .bind(status_to_str(job.status))
        .bind(Json(&job.steps))
        .bind(job.total)
        .bind(job.progress)
        .bind(job.current_step.as_ref().map(|s| s.to_string()))
        .bind(Json(&job.task_ids))
        .bind(&job.payload)
        .bind(&job.logs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        row.into_job()
    }

    async fn update(&self, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                progress = $3,
                current_step = $4,
                task_ids = $5,
                logs = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(status_to_str(job.status))
        .bind(job.progress)
        .bind(job.current_step.as_ref().map(|s| s.to_string()))
        .bind(Json(&job.task_ids))
        .bind(&job.logs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_queued(&self, limit: i64) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = 'QUEUED' ORDER BY created_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_in_flight(&self, limit: i64) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status IN ('SCHEDULED', 'RUNNING') ORDER BY created_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn delete_reapable_before(&self, older_than: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status != 'SCHEDULED' AND created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
