//! Task handlers - the outbound seam to code execution, search, analysis.

use async_trait::async_trait;
use conductor_core::{Payload, Task, TaskType};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error returned by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran and reported a failure
    #[error("{0}")]
    Failed(String),

    /// The handler exceeded the per-task budget
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// Nothing is registered for the task's type
    #[error("no handler registered for task type {0}")]
    Missing(TaskType),
}

impl HandlerError {
    /// Convenience constructor for `Failed`.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Executes tasks of one or more types.
///
/// The queue only relies on the contract "given a task, eventually produce
/// output or an error"; how the handler does it is its own business.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task and return its output payload.
    async fn handle(&self, task: &Task) -> Result<Payload, HandlerError>;
}

/// Adapts an async closure into a `TaskHandler`.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    async fn handle(&self, task: &Task) -> Result<Payload, HandlerError> {
        (self.0)(task.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Task-type to handler dispatch table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the type.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    /// Builder form of `register`.
    pub fn with(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task_type, handler);
        self
    }

    /// Register the same handler for every task type.
    pub fn with_fallback(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        for task_type in TaskType::ALL {
            self.handlers
                .entry(task_type)
                .or_insert_with(|| Arc::clone(&handler));
        }
        self
    }

    /// Handler for a type.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    /// Whether a handler exists for the type.
    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }
}
