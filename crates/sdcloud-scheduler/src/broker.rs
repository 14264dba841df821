//! Celery-shaped broker abstraction.
//!
//! spec.md treats the message broker and result backend purely as external
//! collaborators ("assumed to be ... a work queue with at-least-once
//! delivery plus result backend"). This service needs something concrete to
//! compile and test against, so [`Broker`] models exactly the operations the
//! scheduler loops and pool workers use: `delay` to enqueue, `poll` to read
//! back transport-level task state, `forget` to bound result-backend growth
//! on success, and `revoke` for cancellation. [`LapinRedisBroker`] backs it
//! with AMQP (publish side) and Redis (state side), mirroring the original's
//! RabbitMQ-broker / Redis-backend Celery split (spec.md §6). [`InMemoryBroker`]
//! is the fake the scheduler's own tests and [`crate::worker::PoolWorker`]
//! integration tests run against.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use sdcloud_core::{Error, Pool, Result};
use serde::{Deserialize, Serialize};

/// Transport-level state of a dispatched task, mirroring the states a Celery
/// `AsyncResult` can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure { traceback: String },
}

/// One dispatched unit of work, as a pool worker sees it pulled off its
/// queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub stage_name: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a stage invocation on `pool`'s queue, returning the
    /// broker-assigned task id `dispatch_next` appends to `task_ids`.
    async fn delay(&self, pool: Pool, stage_name: &str, payload: serde_json::Value) -> Result<String>;

    /// Read back the current transport-level state of a previously
    /// dispatched task.
    async fn poll(&self, task_id: &str) -> Result<TaskState>;

    /// Discard a `SUCCESS` result once observed, bounding result-backend
    /// growth (spec.md §5).
    async fn forget(&self, task_id: &str) -> Result<()>;

    /// Ask the broker to deliver a cancellation to whichever worker holds
    /// `task_id`. Best-effort: a worker that already finished the stage will
    /// not observe this.
    async fn revoke(&self, task_id: &str) -> Result<()>;

    /// Pull the next undelivered message for `pool`, if any. Used by
    /// [`crate::worker::PoolWorker`].
    async fn next_message(&self, pool: Pool) -> Result<Option<TaskMessage>>;

    /// Called by a worker immediately after it starts executing a task.
    async fn report_started(&self, task_id: &str) -> Result<()>;

    /// Called by a worker once a stage's container completed cleanly.
    async fn report_success(&self, task_id: &str) -> Result<()>;

    /// Called by a worker when a stage fails; `traceback` becomes the job's
    /// `logs` once the poller observes it.
    async fn report_failure(&self, task_id: &str, traceback: String) -> Result<()>;

    /// True if `task_id` was revoked before a worker could report an
    /// outcome for it. A worker checks this right before running a stage's
    /// container so a cancelled-but-not-yet-started task never runs.
    async fn is_revoked(&self, task_id: &str) -> Result<bool>;
}

struct InMemoryState {
    queues: HashMap<Pool, VecDeque<TaskMessage>>,
    states: HashMap<String, TaskState>,
    revoked: HashSet<String>,
    next_id: u64,
}

/// In-process broker fake: queues are `VecDeque`s keyed by pool, task state
/// lives in a map. No persistence, no cross-process delivery — exactly
/// enough to drive the scheduler loops and pool workers in tests.
pub struct InMemoryBroker {
    state: Mutex<InMemoryState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState {
                queues: HashMap::new(),
                states: HashMap::new(),
                revoked: HashSet::new(),
                next_id: 0,
            }),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn delay(&self, pool: Pool, stage_name: &str, payload: serde_json::Value) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let task_id = format!("task-{}", state.next_id);
        state.states.insert(task_id.clone(), TaskState::Pending);
        state
            .queues
            .entry(pool)
            .or_default()
            .push_back(TaskMessage {
                task_id: task_id.clone(),
                stage_name: stage_name.to_string(),
                payload,
            });
        Ok(task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskState> {
        let state = self.state.lock().unwrap();
        state
            .states
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown task: {task_id}")))
    }

    async fn forget(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.states.remove(task_id);
        Ok(())
    }

    async fn revoke(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.revoked.insert(task_id.to_string());
        Ok(())
    }

    async fn next_message(&self, pool: Pool) -> Result<Option<TaskMessage>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.queues.entry(pool).or_default().pop_front())
    }

    async fn report_started(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.states.insert(task_id.to_string(), TaskState::Started);
        Ok(())
    }

    async fn report_success(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.states.insert(task_id.to_string(), TaskState::Success);
        Ok(())
    }

    async fn report_failure(&self, task_id: &str, traceback: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .states
            .insert(task_id.to_string(), TaskState::Failure { traceback });
        Ok(())
    }

    async fn is_revoked(&self, task_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.revoked.contains(task_id))
    }
}

/// AMQP (publish/revoke) + Redis (state) backed broker, grounded on the
/// RabbitMQ-broker / Redis-backend split spec.md §6 names. `lapin` and
/// `redis` clients are long-lived and cheap to clone (both are internally
/// reference-counted connection handles).
pub struct LapinRedisBroker {
    amqp: lapin::Connection,
    redis: redis::aio::ConnectionManager,
}

impl LapinRedisBroker {
    pub async fn connect(rabbitmq_url: &str, redis_url: &str) -> Result<Self> {
        let amqp = lapin::Connection::connect(rabbitmq_url, lapin::ConnectionProperties::default())
            .await
            .map_err(|e| Error::Internal(format!("connecting to rabbitmq: {e}")))?;
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Internal(format!("parsing redis url: {e}")))?;
        let redis = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Internal(format!("connecting to redis: {e}")))?;
        Ok(Self { amqp, redis })
    }

    fn queue_name(pool: Pool) -> String {
        format!("sdcloud.{pool}")
    }

    fn state_key(task_id: &str) -> String {
        format!("sdcloud:task:{task_id}:state")
    }

    fn revoked_key(task_id: &str) -> String {
        format!("sdcloud:task:{task_id}:revoked")
    }

    async fn channel(&self) -> Result<lapin::Channel> {
        self.amqp
            .create_channel()
            .await
            .map_err(|e| Error::Internal(format!("opening amqp channel: {e}")))
    }
}

#[async_trait]
impl Broker for LapinRedisBroker {
    async fn delay(&self, pool: Pool, stage_name: &str, payload: serde_json::Value) -> Result<String> {
        let task_id = uuid::Uuid::now_v7().to_string();
        let message = TaskMessage {
            task_id: task_id.clone(),
            stage_name: stage_name.to_string(),
            payload,
        };
        let body = serde_json::to_vec(&message)
            .map_err(|e| Error::Internal(format!("serializing task message: {e}")))?;

        let channel = self.channel().await?;
        let queue = Self::queue_name(pool);
        channel
            .queue_declare(
                &queue,
                lapin::options::QueueDeclareOptions::default(),
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Internal(format!("declaring queue {queue}: {e}")))?;
        channel
            .basic_publish(
                "",
                &queue,
                lapin::options::BasicPublishOptions::default(),
                &body,
                lapin::BasicProperties::default(),
            )
            .await
            .map_err(|e| Error::DispatchFailed(format!("publishing to {queue}: {e}")))?;

        let mut redis = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::state_key(&task_id))
            .arg("PENDING")
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::DispatchFailed(format!("recording task state: {e}")))?;

        Ok(task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskState> {
        let mut redis = self.redis.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::state_key(task_id))
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::Internal(format!("reading task state: {e}")))?;

        match raw.as_deref() {
            None => Err(Error::NotFound(format!("unknown task: {task_id}"))),
            Some("PENDING") => Ok(TaskState::Pending),
            Some("STARTED") => Ok(TaskState::Started),
            Some("SUCCESS") => Ok(TaskState::Success),
            Some(other) => {
                if let Some(traceback) = other.strip_prefix("FAILURE:") {
                    Ok(TaskState::Failure {
                        traceback: traceback.to_string(),
                    })
                } else {
                    Err(Error::Internal(format!("unrecognized task state: {other}")))
                }
            }
        }
    }

    async fn forget(&self, task_id: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis::cmd("DEL")
            .arg(Self::state_key(task_id))
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::Internal(format!("forgetting task result: {e}")))?;
        Ok(())
    }

    async fn revoke(&self, task_id: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::revoked_key(task_id))
            .arg(1)
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::Internal(format!("recording revocation: {e}")))?;
        Ok(())
    }

    async fn next_message(&self, pool: Pool) -> Result<Option<TaskMessage>> {
        let channel = self.channel().await?;
        let queue = Self::queue_name(pool);
        let delivery = channel
            .basic_get(&queue, lapin::options::BasicGetOptions::default())
            .await
            .map_err(|e| Error::Internal(format!("polling queue {queue}: {e}")))?;

        let Some(delivery) = delivery else {
            return Ok(None);
        };
        delivery
            .ack(lapin::options::BasicAckOptions::default())
            .await
            .map_err(|e| Error::Internal(format!("acking delivery: {e}")))?;

        let message: TaskMessage = serde_json::from_slice(&delivery.data)
            .map_err(|e| Error::Internal(format!("decoding task message: {e}")))?;
        Ok(Some(message))
    }

    async fn report_started(&self, task_id: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::state_key(task_id))
            .arg("STARTED")
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::Internal(format!("reporting started: {e}")))?;
        Ok(())
    }

    async fn report_success(&self, task_id: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::state_key(task_id))
            .arg("SUCCESS")
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::Internal(format!("reporting success: {e}")))?;
        Ok(())
    }

    async fn report_failure(&self, task_id: &str, traceback: String) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::state_key(task_id))
            .arg(format!("FAILURE:{traceback}"))
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::Internal(format!("reporting failure: {e}")))?;
        Ok(())
    }

    async fn is_revoked(&self, task_id: &str) -> Result<bool> {
        let mut redis = self.redis.clone();
        let flag: Option<i64> = redis::cmd("GET")
            .arg(Self::revoked_key(task_id))
            .query_async(&mut redis)
            .await
            .map_err(|e| Error::Internal(format!("reading revocation flag: {e}")))?;
        Ok(flag.unwrap_or(0) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delay_then_poll_starts_pending() {
        let broker = InMemoryBroker::new();
        let task_id = broker
            .delay(Pool::Cpu, "stage_0", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(broker.poll(&task_id).await.unwrap(), TaskState::Pending);
    }

    #[tokio::test]
    async fn next_message_drains_the_right_pool_queue() {
        let broker = InMemoryBroker::new();
        broker
            .delay(Pool::Cpu, "stage_0", serde_json::json!({"a": 1}))
            .await
            .unwrap();
        broker
            .delay(Pool::Gpu, "stage_2", serde_json::json!({"b": 2}))
            .await
            .unwrap();

        let cpu_msg = broker.next_message(Pool::Cpu).await.unwrap().unwrap();
        assert_eq!(cpu_msg.stage_name, "stage_0");
        assert!(broker.next_message(Pool::Cpu).await.unwrap().is_none());

        let gpu_msg = broker.next_message(Pool::Gpu).await.unwrap().unwrap();
        assert_eq!(gpu_msg.stage_name, "stage_2");
    }

    #[tokio::test]
    async fn report_success_then_forget_removes_state() {
        let broker = InMemoryBroker::new();
        let task_id = broker
            .delay(Pool::Cpu, "stage_0", serde_json::json!({}))
            .await
            .unwrap();
        broker.report_success(&task_id).await.unwrap();
        assert_eq!(broker.poll(&task_id).await.unwrap(), TaskState::Success);
        broker.forget(&task_id).await.unwrap();
        assert!(broker.poll(&task_id).await.is_err());
    }

    #[tokio::test]
    async fn revoke_is_observable_before_a_worker_starts() {
        let broker = InMemoryBroker::new();
        let task_id = broker
            .delay(Pool::Gpu, "stage_2", serde_json::json!({}))
            .await
            .unwrap();
        assert!(!broker.is_revoked(&task_id).await.unwrap());
        broker.revoke(&task_id).await.unwrap();
        assert!(broker.is_revoked(&task_id).await.unwrap());
    }
}
