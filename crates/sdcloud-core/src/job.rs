//! Job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::stage::StageId;

/// Lifecycle state of a job.
///
/// Transitions: `Queued -> Scheduled -> Running -> {Succeeded, Failed}`, with
/// `Cancelled` reachable from `Queued`, `Scheduled`, or `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A durable job record.
///
/// `steps` and `payload` are frozen at creation time; `task_ids` is
/// append-only. See the invariants enforced by [`Job::advance`],
/// [`Job::fail`], and [`Job::cancel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub steps: Vec<StageId>,
    pub total: i32,
    pub progress: i32,
    pub current_step: Option<StageId>,
    pub task_ids: Vec<String>,
    pub payload: serde_json::Value,
    pub logs: Option<String>,
}

impl Job {
    pub fn new(steps: Vec<StageId>, payload: serde_json::Value) -> Self {
        let total = steps.len() as i32;
        Self {
            id: JobId::new(),
            created_at: Utc::now(),
            status: JobStatus::Queued,
            steps,
            total,
            progress: 0,
            current_step: None,
            task_ids: Vec::new(),
            payload,
            logs: None,
        }
    }

    /// The stage the job is currently on, or about to start.
    pub fn step_at(&self, progress: i32) -> Option<&StageId> {
        self.steps.get(progress as usize)
    }

    /// Move from `Queued` to `Scheduled`, dispatching the first step.
    ///
    /// Callers are expected to have already enqueued the task and appended
    /// its id before calling this; `task_id` is the id to append.
    pub fn schedule(&mut self, task_id: String) {
        debug_assert_eq!(self.status, JobStatus::Queued);
        self.current_step = self.step_at(self.progress).cloned();
        self.task_ids.push(task_id);
        self.status = JobStatus::Scheduled;
    }

    /// Mark the job as actively running its current step.
    pub fn mark_running(&mut self) {
        if self.status == JobStatus::Scheduled {
            self.status = JobStatus::Running;
        }
    }

    /// Advance past the current step. If this was the last step, the job
    /// succeeds; otherwise the next step is dispatched and appended.
    pub fn advance(&mut self, next_task_id: Option<String>) {
        self.progress += 1;
        if self.progress >= self.total {
            self.status = JobStatus::Succeeded;
            self.current_step = None;
        } else {
            self.current_step = self.step_at(self.progress).cloned();
            self.status = JobStatus::Scheduled;
            if let Some(id) = next_task_id {
                self.task_ids.push(id);
            }
        }
    }

    pub fn fail(&mut self, log: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.logs = Some(log.into());
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = JobStatus::Cancelled;
        }
    }

    /// Check the invariants a valid `Job` must satisfy at rest.
    pub fn check_invariants(&self) -> bool {
        if self.progress > self.total {
            return false;
        }
        if self.status == JobStatus::Succeeded && self.progress != self.total {
            return false;
        }
        if matches!(self.status, JobStatus::Scheduled | JobStatus::Running) {
            if self.task_ids.is_empty() {
                return false;
            }
            if self.current_step.as_ref() != self.step_at(self.progress) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(n: usize) -> Vec<StageId> {
        (0..n)
            .map(|i| format!("cpu.stage_{i}").parse().unwrap())
            .collect()
    }

    #[test]
    fn new_job_starts_queued_with_zero_progress() {
        let job = Job::new(steps(3), serde_json::json!({}));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.total, 3);
        assert!(job.check_invariants());
    }

    #[test]
    fn schedule_then_advance_through_all_steps_succeeds() {
        let mut job = Job::new(steps(2), serde_json::json!({}));
        job.schedule("task-1".into());
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.check_invariants());

        job.mark_running();
        job.advance(Some("task-2".into()));
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.progress, 1);
        assert!(job.check_invariants());

        job.mark_running();
        job.advance(None);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.progress, job.total);
        assert!(job.check_invariants());
    }

    #[test]
    fn fail_is_terminal_and_cancel_is_a_noop_after() {
        let mut job = Job::new(steps(1), serde_json::json!({}));
        job.schedule("task-1".into());
        job.fail("boom");
        assert_eq!(job.status, JobStatus::Failed);
        job.cancel();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn cancel_from_queued_is_terminal() {
        let mut job = Job::new(steps(1), serde_json::json!({}));
        job.cancel();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.status.is_terminal());
    }
}
