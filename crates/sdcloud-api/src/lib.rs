//! HTTP surface for the job-orchestration service: `/schedule_job`,
//! `/check_status`, `/get_download_url`, `/cancel_job`, plus a health check.
//!
//! The ingress's own multipart parsing is the only part of this crate
//! spec.md treats as out of core scope; everything downstream of "a job row
//! got created" runs through [`sdcloud_pipeline`] and [`sdcloud_scheduler`]
//! exactly as the scheduler process does.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use state::AppState;
