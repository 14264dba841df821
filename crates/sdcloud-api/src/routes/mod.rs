//! API routes.

pub mod health;
pub mod jobs;

use axum::Router;

use crate::AppState;

/// Build the full API router: health check plus the four job endpoints
/// spec.md §6 names (`/schedule_job`, `/check_status`, `/get_download_url`,
/// `/cancel_job`).
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(jobs::router())
        .with_state(state)
}
