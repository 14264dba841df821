//! Per-invocation collaborators a [`crate::registry::StageTask`] runs with.

use std::path::PathBuf;
use std::sync::Arc;

use object_store::ObjectStore;
use sdcloud_core::JobId;
use sdcloud_executor::ContainerRunner;

/// Everything a stage needs to run: where its scratch directory lives, which
/// container runner and blob store to use, and identifiers to name its
/// container deterministically.
pub struct StageExecutionContext {
    pub job_id: JobId,
    pub task_id: String,
    pub job_dir: PathBuf,
    pub queue_image_tag: String,
    pub image_registry: String,
    pub runner: Arc<dyn ContainerRunner>,
    pub store: Arc<dyn ObjectStore>,
}

impl StageExecutionContext {
    pub fn input_dir(&self) -> PathBuf {
        self.job_dir.join("job/input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.job_dir.join("job/output")
    }

    pub fn image(&self, image_name: &str) -> String {
        format!("{}/{}:{}", self.image_registry, image_name, self.queue_image_tag)
    }
}
