//! Event model - notifications published by the orchestrator.

use serde::Serialize;

use crate::chain::StepOutcome;
use crate::id::{ChainId, EventId, ExecutionId, ReactionId, ScheduledTaskId, StepId, TaskId};
use crate::task::{TaskPriority, TaskType};
use crate::Time;

/// An event is an atomic notification that happened at a specific time.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Unique identifier
    pub id: EventId,

    /// When it happened
    pub timestamp: Time,

    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Stamp an event kind with an id and the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: chrono::Utc::now(),
            kind,
        }
    }

    /// Event name, e.g. `task:added`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Every notification the orchestrator emits.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum EventKind {
    /// A task entered the queue
    #[serde(rename = "task:added")]
    TaskAdded {
        task_id: TaskId,
        task_type: TaskType,
        priority: TaskPriority,
    },

    /// A task's handler returned output
    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: TaskId, task_type: TaskType },

    /// A task's handler returned an error or timed out
    #[serde(rename = "task:failed")]
    TaskFailed {
        task_id: TaskId,
        task_type: TaskType,
        error: String,
    },

    /// A chain was registered
    #[serde(rename = "chain:created")]
    ChainCreated {
        chain_id: ChainId,
        name: String,
        steps: usize,
    },

    /// A chain step attempt began
    #[serde(rename = "chain:step_started")]
    ChainStepStarted {
        chain_id: ChainId,
        step_id: StepId,
        index: usize,
        attempt: u32,
    },

    /// A chain step recorded its result
    #[serde(rename = "chain:step_completed")]
    ChainStepCompleted {
        chain_id: ChainId,
        step_id: StepId,
        status: StepOutcome,
    },

    /// Every step of a chain succeeded
    #[serde(rename = "chain:completed")]
    ChainCompleted { chain_id: ChainId, steps_run: usize },

    /// A chain finished with at least one unsuccessful step
    #[serde(rename = "chain:failed")]
    ChainFailed { chain_id: ChainId, steps_run: usize },

    /// A scheduled task inserted a task into the queue
    #[serde(rename = "scheduled_task:running")]
    ScheduledTaskRunning {
        scheduled_id: ScheduledTaskId,
        task_id: TaskId,
        run_count: u32,
    },

    /// A scheduled task reached its run ceiling
    #[serde(rename = "scheduled_task:completed")]
    ScheduledTaskCompleted {
        scheduled_id: ScheduledTaskId,
        run_count: u32,
    },

    /// A scheduled task could not insert its task
    #[serde(rename = "scheduled_task:failed")]
    ScheduledTaskFailed {
        scheduled_id: ScheduledTaskId,
        error: String,
    },

    /// A reaction rule matched an execution
    #[serde(rename = "reaction:triggered")]
    ReactionTriggered {
        reaction_id: ReactionId,
        rule: String,
        execution_id: ExecutionId,
        action: String,
        task_id: Option<TaskId>,
    },
}

impl EventKind {
    /// Event name, e.g. `chain:step_started`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskAdded { .. } => "task:added",
            EventKind::TaskCompleted { .. } => "task:completed",
            EventKind::TaskFailed { .. } => "task:failed",
            EventKind::ChainCreated { .. } => "chain:created",
            EventKind::ChainStepStarted { .. } => "chain:step_started",
            EventKind::ChainStepCompleted { .. } => "chain:step_completed",
            EventKind::ChainCompleted { .. } => "chain:completed",
            EventKind::ChainFailed { .. } => "chain:failed",
            EventKind::ScheduledTaskRunning { .. } => "scheduled_task:running",
            EventKind::ScheduledTaskCompleted { .. } => "scheduled_task:completed",
            EventKind::ScheduledTaskFailed { .. } => "scheduled_task:failed",
            EventKind::ReactionTriggered { .. } => "reaction:triggered",
        }
    }
}
