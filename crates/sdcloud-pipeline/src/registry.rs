//! Explicit stage registry.
//!
//! The original scheduler resolves `pool.cmd` to a callable via
//! `getattr(getattr(queues, pool), cmd)` — a reflective attribute lookup.
//! This service replaces that with an explicit compile-time map from
//! [`StageId`] to a [`StageTask`] implementation, so an unknown stage name
//! fails at dispatch time with a clear error instead of an `AttributeError`.

use std::collections::HashMap;
use std::sync::Arc;

use sdcloud_core::{Error, Result, StageId};

use crate::execution::StageExecutionContext;

/// One runnable stage. Implementations own their command template, image
/// resolution, and any context fields they populate.
#[async_trait::async_trait]
pub trait StageTask: Send + Sync {
    fn id(&self) -> &StageId;

    /// Only the planner stage (`cpu.prestage_0`) is true: it receives the
    /// full submission payload and synthesizes the initial context rather
    /// than loading one from shared scratch.
    fn is_planner(&self) -> bool {
        false
    }

    /// Run the stage against the shared scratch directory described by
    /// `ectx`. `context` is the context loaded from shared scratch (empty
    /// for the planner stage, which builds its own); `payload` is the job's
    /// full stored payload, which every stage but the planner ignores.
    /// Returns the (possibly updated) context; an `Err` means the stage is
    /// considered failed.
    async fn run(
        &self,
        ectx: &StageExecutionContext,
        context: serde_json::Value,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Maps stage ids to their implementation. Built once at process startup.
#[derive(Default)]
pub struct StageRegistry {
    tasks: HashMap<StageId, Arc<dyn StageTask>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Arc<dyn StageTask>) {
        self.tasks.insert(task.id().clone(), task);
    }

    pub fn get(&self, id: &StageId) -> Result<Arc<dyn StageTask>> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DispatchFailed(format!("no stage registered for {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(StageId);

    #[async_trait::async_trait]
    impl StageTask for Noop {
        fn id(&self) -> &StageId {
            &self.0
        }

        async fn run(
            &self,
            _ectx: &StageExecutionContext,
            context: serde_json::Value,
            _payload: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(context)
        }
    }

    #[test]
    fn unregistered_stage_is_a_dispatch_error() {
        let registry = StageRegistry::new();
        let id: StageId = "cpu.stage_0".parse().unwrap();
        assert!(registry.get(&id).is_err());
    }

    #[test]
    fn registered_stage_is_found_by_id() {
        let mut registry = StageRegistry::new();
        let id: StageId = "cpu.stage_0".parse().unwrap();
        registry.register(Arc::new(Noop(id.clone())));
        assert!(registry.get(&id).is_ok());
    }
}
