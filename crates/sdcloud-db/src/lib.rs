//! Database layer for the job-orchestration service.
//!
//! A single `jobs` table backs the whole state machine; there is no
//! generated query layer, just [`repo::job::PgJobRepo`] hand-written against
//! `sqlx::query_as!`.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::job::{JobRepo, PgJobRepo};

#[cfg(feature = "test-support")]
pub use repo::test_support;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
