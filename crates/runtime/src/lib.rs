//! Conductor runtime - configuration and the orchestrator context.

#![warn(missing_docs)]

pub mod config;
pub mod orchestrator;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::Orchestrator;
