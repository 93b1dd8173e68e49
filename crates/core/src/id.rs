//! Unique identifiers for orchestration entities.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Ulid);

        impl $name {
            /// Generate a new identifier.
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a queued Task
    TaskId
);

ulid_id!(
    /// Unique identifier for a ScheduledTask
    ScheduledTaskId
);

ulid_id!(
    /// Unique identifier for a TaskChain
    ChainId
);

ulid_id!(
    /// Unique identifier for a triggered Reaction
    ReactionId
);

ulid_id!(
    /// Unique identifier for an emitted Event
    EventId
);

ulid_id!(
    /// Unique identifier for a code Execution
    ExecutionId
);

ulid_id!(
    /// Unique identifier for an ExecutionSession
    SessionId
);

/// Identifier of a step inside a chain.
///
/// Step ids are chosen by the chain author so that branch pointers
/// (`on_success` / `on_failure`) can name them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    /// Create a step id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrips_through_display() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ChainId::new(), ChainId::new());
    }

    #[test]
    fn test_step_id_from_str() {
        let id: StepId = "build".into();
        assert_eq!(id.as_str(), "build");
        assert_eq!(id.to_string(), "build");
    }
}
