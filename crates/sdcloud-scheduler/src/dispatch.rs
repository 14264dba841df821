//! Wraps a job's next-step lookup and the broker's `delay` call into a
//! single dispatch operation, returning the task id callers append via
//! [`sdcloud_core::Job::schedule`] or [`sdcloud_core::Job::advance`].
//!
//! Deliberately does not touch job state itself: the promoter and poller own
//! when a job transitions, this module only knows how to put a message on
//! the wire for whichever step a caller asks about.

use sdcloud_core::{Error, Job, Result};

use crate::broker::Broker;

/// Enqueue the stage at `progress` for `job`. Only `progress == 0` carries
/// the job's full submission payload; every later step's worker only needs
/// `job_id` to re-derive context from the shared archive.
pub async fn dispatch_step_at(job: &Job, progress: i32, broker: &dyn Broker) -> Result<String> {
    let stage_id = job
        .step_at(progress)
        .ok_or_else(|| Error::Internal(format!("job {} has no step at progress {progress}", job.id)))?
        .clone();

    let payload = serde_json::json!({
        "job_id": job.id.to_string(),
        "payload": if progress == 0 { job.payload.clone() } else { serde_json::Value::Null },
    });

    broker.delay(stage_id.pool(), &stage_id.to_string(), payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use sdcloud_core::StageId;

    fn steps(names: &[&str]) -> Vec<StageId> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn first_step_carries_the_submission_payload() {
        let broker = InMemoryBroker::new();
        let job = Job::new(
            steps(&["cpu.prestage_0", "cpu.cleanup"]),
            serde_json::json!({"pos_prompt": "a chair"}),
        );
        let task_id = dispatch_step_at(&job, 0, &broker).await.unwrap();
        assert!(!task_id.is_empty());
    }

    #[tokio::test]
    async fn dispatching_past_the_last_step_is_an_error() {
        let broker = InMemoryBroker::new();
        let job = Job::new(steps(&["cpu.prestage_0"]), serde_json::json!({}));
        assert!(dispatch_step_at(&job, 5, &broker).await.is_err());
    }
}
