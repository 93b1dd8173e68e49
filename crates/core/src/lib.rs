//! Conductor core data models.
//!
//! This crate defines the data structures shared by the task queue, the
//! scheduler, the chain executor and the reactive bridge.

#![warn(missing_docs)]

// Core identities
mod id;
mod error;
mod predicate;

// Queue and policies
mod task;
mod schedule;
mod chain;

// Collaborator state and notifications
mod execution;
mod event;

// Re-exports
pub use id::*;
pub use error::CoreError;
pub use predicate::Predicate;

pub use task::{Payload, Task, TaskPriority, TaskSpec, TaskStatus, TaskType};
pub use schedule::{
    AfterCondition, ScheduleConfig, SchedulePolicy, ScheduleStatus, ScheduledTask, Upstream,
};
pub use chain::{
    ChainConfig, ChainStatus, ChainStep, ChainStepResult, StepCondition, StepOutcome, TaskChain,
};
pub use execution::{Artifact, Execution, ExecutionSession, ExecutionStatus};
pub use event::{Event, EventKind};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
