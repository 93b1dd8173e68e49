//! Reaction rules and the records they leave behind.

use conductor_core::{Execution, ExecutionId, ReactionId, TaskId, Time};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::action::ReactionAction;

type Matcher = dyn Fn(&Execution) -> Option<ReactionAction> + Send + Sync;

/// A named, pure mapping from an execution outcome to an optional action.
#[derive(Clone)]
pub struct ReactionRule {
    name: String,
    matcher: Arc<Matcher>,
}

impl ReactionRule {
    /// Create a rule.
    pub fn new(
        name: impl Into<String>,
        matcher: impl Fn(&Execution) -> Option<ReactionAction> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            matcher: Arc::new(matcher),
        }
    }

    /// Rule name, unique within a bridge.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate against a finished execution.
    pub fn evaluate(&self, execution: &Execution) -> Option<ReactionAction> {
        (self.matcher)(execution)
    }
}

impl fmt::Debug for ReactionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionRule").field("name", &self.name).finish()
    }
}

/// A triggered rule.
#[derive(Debug, Clone, Serialize)]
pub struct Reaction {
    /// Unique identifier
    pub id: ReactionId,

    /// Rule that matched
    pub rule: String,

    /// Execution it matched
    pub execution_id: ExecutionId,

    /// What the rule asked for
    pub action: ReactionAction,

    /// Task inserted by the dispatch, if any
    pub task_id: Option<TaskId>,

    /// Why the dispatch could not insert a task
    pub error: Option<String>,

    /// When the rule matched
    pub timestamp: Time,
}

impl Reaction {
    /// Whether dispatch inserted a task.
    pub fn dispatched(&self) -> bool {
        self.task_id.is_some()
    }
}
