//! Repository traits and implementations.

pub mod job;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use job::{JobRepo, PgJobRepo};

#[cfg(feature = "test-support")]
pub use test_support::InMemoryJobRepo;
