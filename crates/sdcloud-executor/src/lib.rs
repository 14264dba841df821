//! The container runner: resolves a stage's image, interpolates its command
//! template against the stage context, runs it to completion, and classifies
//! the outcome from its captured logs.

pub mod runner;
pub mod template;

pub use runner::{ContainerRunner, ContainerSpec, DockerContainerRunner};
pub use template::interpolate;
