//! Code execution records produced by the sandbox collaborator.
//!
//! The orchestrator never runs code itself; it only reads these records to
//! decide on follow-up work.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::id::{ExecutionId, SessionId};
use crate::Time;

/// Status of a code execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Submitted, not started
    Pending,
    /// In the sandbox
    Running,
    /// Exited cleanly
    Success,
    /// Raised or exited non-zero
    Error,
    /// Killed by the sandbox time limit
    Timeout,
}

impl ExecutionStatus {
    /// Whether the execution has finished one way or another.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Error | ExecutionStatus::Timeout
        )
    }
}

/// A file or blob produced by an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name
    pub name: String,
    /// MIME type or coarse kind ("image/png", "csv", ...)
    pub kind: String,
    /// Where the collaborator stored it
    pub location: String,
}

/// One code execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier
    pub id: ExecutionId,

    /// Owning session
    pub session_id: Option<SessionId>,

    /// Source that was run
    pub code: String,

    /// Language ("python", "javascript", ...)
    pub language: String,

    /// Status
    pub status: ExecutionStatus,

    /// Captured stdout
    pub output: Option<String>,

    /// Captured error text
    pub error: Option<String>,

    /// Wall-clock duration
    pub duration: Option<Duration>,

    /// Produced artifacts
    #[serde(default)]
    pub artifacts: Vec<Artifact>,

    /// When the execution was submitted
    pub created_at: Time,
}

impl Execution {
    /// Create a pending execution.
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            session_id: None,
            code: code.into(),
            language: language.into(),
            status: ExecutionStatus::Pending,
            output: None,
            error: None,
            duration: None,
            artifacts: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Mark as finished successfully with output.
    pub fn succeeded(mut self, output: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Success;
        self.output = Some(output.into());
        self
    }

    /// Mark as failed with error text.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Error;
        self.error = Some(error.into());
        self
    }

    /// Mark as killed by the time limit.
    pub fn timed_out(mut self, after: Duration) -> Self {
        self.status = ExecutionStatus::Timeout;
        self.duration = Some(after);
        self.error = Some(format!("Execution timed out after {}ms", after.as_millis()));
        self
    }

    /// Attach an artifact.
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Set the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// A sequence of executions from one conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSession {
    /// Unique identifier
    pub id: SessionId,

    /// Executions in submission order
    pub executions: Vec<Execution>,
}

impl ExecutionSession {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an execution, stamping it with this session's id.
    pub fn push(&mut self, mut execution: Execution) {
        execution.session_id = Some(self.id);
        self.executions.push(execution);
    }

    /// Most recent execution.
    pub fn latest(&self) -> Option<&Execution> {
        self.executions.last()
    }

    /// Executions that have finished.
    pub fn finished(&self) -> impl Iterator<Item = &Execution> {
        self.executions.iter().filter(|e| e.status.is_finished())
    }
}
