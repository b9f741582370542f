//! See README.md for more

mod config;
mod images;

/// The capability facade over the container engine, with a [bollard] backed
/// implementation.
pub mod engine;
/// Request-scoped coordination: image selection, container launch, result
/// collection, teardown.
pub mod orchestrator;
/// The in-container agent: bundle unpacking and the build/run pipeline.
pub mod runner;
/// The HTTP surface of the deployer daemon.
pub mod server;

pub use config::*;
pub use images::*;
