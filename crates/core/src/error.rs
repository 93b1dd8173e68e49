//! Errors raised by core model operations.

use crate::id::TaskId;
use crate::task::TaskStatus;

/// Errors that can occur when mutating core models.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// A task status change that would break monotonicity
    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task being mutated
        task: TaskId,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },
}
