//! Submission validation, stage planning, and the stage registry that ties
//! a [`StageId`](sdcloud_core::StageId) to the code that runs it.

pub mod execution;
pub mod planner;
pub mod registry;
pub mod stages;
pub mod submission;

pub use execution::StageExecutionContext;
pub use planner::plan;
pub use registry::{StageRegistry, StageTask};
pub use stages::default_registry;
pub use submission::{DepthAlgorithm, RemeshMode, RunConfig, SUPPORTED_LORAS};
