//! Task model - the unit of work owned by the queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::id::TaskId;
use crate::Time;

/// Opaque key-value payload carried by tasks.
pub type Payload = serde_json::Map<String, Value>;

/// Kind of work a task represents; selects the handler it is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Run a piece of code in a sandbox
    CodeExecution,
    /// Query a search backend
    WebSearch,
    /// Inspect an uploaded or generated file
    FileAnalysis,
    /// Ask the model to decide between options
    Decision,
    /// Record something learned for later turns
    Learning,
    /// Watch an external resource
    Monitoring,
    /// Anything else
    Custom,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [TaskType; 7] = [
        TaskType::CodeExecution,
        TaskType::WebSearch,
        TaskType::FileAnalysis,
        TaskType::Decision,
        TaskType::Learning,
        TaskType::Monitoring,
        TaskType::Custom,
    ];

    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CodeExecution => "code_execution",
            TaskType::WebSearch => "web_search",
            TaskType::FileAnalysis => "file_analysis",
            TaskType::Decision => "decision",
            TaskType::Learning => "learning",
            TaskType::Monitoring => "monitoring",
            TaskType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Ordered so that `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work
    Low,
    /// Default
    Medium,
    /// Follow-ups the user is waiting on
    High,
    /// Must run before anything else
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

/// Lifecycle status of a task.
///
/// `Pending -> Running -> Completed | Failed`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending,
    /// Dispatched to a handler
    Running,
    /// Handler returned output
    Completed,
    /// Handler returned an error or timed out
    Failed,
}

impl TaskStatus {
    /// Whether the status is `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Template from which queue tasks are created.
///
/// Scheduled tasks, chain steps and reactions all carry a `TaskSpec` and
/// hand a clone of it to the queue on every activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Preallocated id. Lets callers reference a task before it is enqueued.
    #[serde(default)]
    pub id: Option<TaskId>,

    /// Handler selector
    pub task_type: TaskType,

    /// Human readable description
    pub description: String,

    /// Priority
    #[serde(default)]
    pub priority: TaskPriority,

    /// Input payload
    #[serde(default)]
    pub input: Payload,

    /// Tasks that must be terminal before this one runs
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

impl TaskSpec {
    /// Create a spec with medium priority and an empty input.
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type,
            description: description.into(),
            priority: TaskPriority::default(),
            input: Payload::new(),
            depends_on: Vec::new(),
        }
    }

    /// Use a preallocated id.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set one input field.
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, id: TaskId) -> Self {
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }
}

/// A task is a single dispatched unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Handler selector
    pub task_type: TaskType,

    /// Human readable description
    pub description: String,

    /// Priority
    pub priority: TaskPriority,

    /// Current status
    pub status: TaskStatus,

    /// Input payload
    pub input: Payload,

    /// Output payload, set on completion
    pub output: Option<Payload>,

    /// Error message, set on failure
    pub error: Option<String>,

    /// Dependencies (deduplicated)
    pub depends_on: Vec<TaskId>,

    /// Creation timestamp
    pub created_at: Time,

    /// When the task was dispatched
    pub started_at: Option<Time>,

    /// When the task reached a terminal state
    pub completed_at: Option<Time>,
}

impl Task {
    /// Materialize a pending task from a spec.
    pub fn from_spec(spec: TaskSpec) -> Self {
        let mut depends_on = Vec::with_capacity(spec.depends_on.len());
        for dep in spec.depends_on {
            if !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }

        Self {
            id: spec.id.unwrap_or_default(),
            task_type: spec.task_type,
            description: spec.description,
            priority: spec.priority,
            status: TaskStatus::Pending,
            input: spec.input,
            output: None,
            error: None,
            depends_on,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the task has reached `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `Pending -> Running`.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `Running -> Completed` with output.
    pub fn complete(&mut self, output: Payload) -> Result<(), CoreError> {
        self.transition(TaskStatus::Completed)?;
        self.output = Some(output);
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `Pending | Running -> Failed` with an error message.
    ///
    /// Pending tasks may fail directly, e.g. when no handler exists.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Wall-clock time between dispatch and termination.
    pub fn duration(&self) -> Option<std::time::Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), CoreError> {
        let allowed = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Failed)
        );
        if !allowed {
            return Err(CoreError::InvalidTransition {
                task: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
