//! Control loops and stage-pool broker for the job-orchestration service.
//!
//! Three independent periodic loops drive a job from submission to a
//! terminal state: the promoter dispatches `QUEUED` jobs' first step, the
//! poller advances `SCHEDULED`/`RUNNING` jobs as their dispatched tasks
//! report back, and the reaper deletes old terminal rows. Each loop is its
//! own `tokio` task under [`loops::spawn_periodic`], mirroring the
//! independent APScheduler jobs the original process runs side by side
//! rather than a single shared scheduling loop.
//!
//! [`broker::Broker`] abstracts the message queue and result backend a pool
//! worker and the control loops talk through; [`worker::PoolWorker`] is the
//! per-pool consumer that actually runs a dispatched stage.

pub mod broker;
pub mod dispatch;
pub mod loops;
pub mod poller;
pub mod promoter;
pub mod reaper;
pub mod worker;

pub use broker::{Broker, InMemoryBroker, LapinRedisBroker, TaskMessage, TaskState};
pub use dispatch::dispatch_step_at;
pub use loops::spawn_periodic;
pub use poller::{poller_tick, run_poller_tick};
pub use promoter::{promoter_tick, run_promoter_tick};
pub use reaper::{reaper_tick, run_reaper_tick, DEFAULT_RETENTION};
pub use worker::PoolWorker;
