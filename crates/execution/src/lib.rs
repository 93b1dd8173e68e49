//! Execution layer - the task queue and its loop, scheduling, and chains.

#![warn(missing_docs)]

pub mod events;
pub mod handler;
pub mod selector;
pub mod dependency;
pub mod queue;
pub mod engine;
pub mod scheduler;
pub mod chain;

pub use events::{EventBus, EventSettings};
pub use handler::{handler_fn, FnHandler, HandlerError, HandlerRegistry, TaskHandler};
pub use selector::{Candidate, PrioritySelector, TaskSelector};
pub use dependency::{DependencyResolver, Resolution};
pub use queue::{QueueError, QueueSnapshot, TaskQueue};
pub use engine::{CycleResult, EngineConfig, ExecutionEngine};
pub use scheduler::{Activation, ScheduleError, TaskScheduler};
pub use chain::{ChainError, ChainExecutor, ChainSettings};
