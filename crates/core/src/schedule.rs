//! Scheduled task model - deferred or recurring queue insertions.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::id::{ScheduledTaskId, TaskId};
use crate::predicate::Predicate;
use crate::task::{TaskSpec, TaskStatus};
use crate::Time;

/// Inserted task ids kept per scheduled task.
pub const INSERTED_HISTORY: usize = 64;

/// When a scheduled task inserts its template into the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Insert once at an absolute time (immediately if already past)
    Once {
        /// Activation time
        at: Time,
    },

    /// Insert repeatedly with a fixed period
    Interval {
        /// Period between activations
        every: Duration,
    },

    /// Insert whenever a named external event fires
    Trigger {
        /// Event name
        event: String,
        /// Optional filter over the event payload
        predicate: Option<Predicate<Value>>,
    },

    /// Insert whenever an upstream task terminates in a matching state
    After {
        /// Which task(s) to watch
        upstream: Upstream,
        /// Terminal state that activates this schedule
        condition: AfterCondition,
    },
}

/// Upstream of an `After` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Upstream {
    /// One concrete queued task
    Task(TaskId),
    /// Any task inserted by another scheduled task
    Scheduled(ScheduledTaskId),
}

/// Terminal state an `After` policy reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterCondition {
    /// Upstream completed
    Success,
    /// Upstream failed
    Failure,
    /// Either
    Any,
}

impl AfterCondition {
    /// Whether a terminal status satisfies this condition.
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            AfterCondition::Success => status == TaskStatus::Completed,
            AfterCondition::Failure => status == TaskStatus::Failed,
            AfterCondition::Any => status.is_terminal(),
        }
    }
}

impl SchedulePolicy {
    /// One-shot activation at `at`.
    pub fn once(at: Time) -> Self {
        SchedulePolicy::Once { at }
    }

    /// Fixed-period activation.
    pub fn interval(every: Duration) -> Self {
        SchedulePolicy::Interval { every }
    }

    /// Activation on every firing of `event`.
    pub fn trigger(event: impl Into<String>) -> Self {
        SchedulePolicy::Trigger {
            event: event.into(),
            predicate: None,
        }
    }

    /// Activation on every firing of `event` whose payload passes `predicate`.
    pub fn trigger_when(
        event: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        SchedulePolicy::Trigger {
            event: event.into(),
            predicate: Some(Predicate::new(predicate)),
        }
    }

    /// Activation after `upstream` terminates in a state matching `condition`.
    pub fn after(upstream: Upstream, condition: AfterCondition) -> Self {
        SchedulePolicy::After { upstream, condition }
    }

    /// Whether the policy is driven by a timer.
    pub fn is_time_based(&self) -> bool {
        matches!(self, SchedulePolicy::Once { .. } | SchedulePolicy::Interval { .. })
    }

    /// Time of the first activation, for timer-driven policies.
    pub fn first_run(&self, now: Time) -> Option<Time> {
        match self {
            SchedulePolicy::Once { at } => Some((*at).max(now)),
            SchedulePolicy::Interval { every } => Some(advance(now, *every)),
            _ => None,
        }
    }

    /// Whether a fired trigger activates this policy.
    pub fn accepts_trigger(&self, name: &str, payload: &Value) -> bool {
        match self {
            SchedulePolicy::Trigger { event, predicate } => {
                event == name && predicate.as_ref().map_or(true, |p| p.test(payload))
            }
            _ => false,
        }
    }

    /// Whether a task termination activates this policy.
    ///
    /// `origin` is the scheduled task that inserted the terminated task, if any.
    pub fn accepts_completion(
        &self,
        task_id: TaskId,
        origin: Option<ScheduledTaskId>,
        status: TaskStatus,
    ) -> bool {
        let SchedulePolicy::After { upstream, condition } = self else {
            return false;
        };
        let watched = match upstream {
            Upstream::Task(id) => *id == task_id,
            Upstream::Scheduled(id) => origin == Some(*id),
        };
        watched && condition.matches(status)
    }
}

/// `now + every`, saturating at the largest representable time.
fn advance(now: Time, every: Duration) -> Time {
    chrono::Duration::from_std(every)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

/// Scheduled task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Will activate when its policy fires
    Active,
    /// Cancelled; timer released
    Paused,
    /// Reached its run ceiling
    Completed,
    /// Its policy can no longer fire
    Failed,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleStatus::Active => write!(f, "active"),
            ScheduleStatus::Paused => write!(f, "paused"),
            ScheduleStatus::Completed => write!(f, "completed"),
            ScheduleStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Registration request for a scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Activation policy
    pub policy: SchedulePolicy,
    /// Template inserted on each activation
    pub task: TaskSpec,
    /// Optional run ceiling
    pub max_runs: Option<u32>,
}

impl ScheduleConfig {
    /// Create a config with no run ceiling.
    pub fn new(name: impl Into<String>, policy: SchedulePolicy, task: TaskSpec) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            policy,
            task,
            max_runs: None,
        }
    }

    /// Set description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Set the run ceiling.
    pub fn max_runs(mut self, max: u32) -> Self {
        self.max_runs = Some(max);
        self
    }
}

/// A recurring or deferred instruction to insert a task into the queue.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    /// Unique identifier
    pub id: ScheduledTaskId,

    /// Name
    pub name: String,

    /// Description
    pub description: String,

    /// Activation policy
    pub policy: SchedulePolicy,

    /// Template inserted on each activation
    pub task: TaskSpec,

    /// Current status
    pub status: ScheduleStatus,

    /// Successful insertions so far
    pub run_count: u32,

    /// Run ceiling
    pub max_runs: Option<u32>,

    /// Last successful insertion
    pub last_run: Option<Time>,

    /// Next planned activation (timer-driven policies only)
    pub next_run: Option<Time>,

    /// Creation timestamp
    pub created_at: Time,

    /// Most recent tasks inserted by this schedule, oldest first, at most
    /// `INSERTED_HISTORY`
    pub inserted: Vec<TaskId>,
}

impl ScheduledTask {
    /// Create an active scheduled task from a config.
    pub fn new(config: ScheduleConfig) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: ScheduledTaskId::new(),
            name: config.name,
            description: config.description,
            next_run: config.policy.first_run(now),
            policy: config.policy,
            task: config.task,
            status: ScheduleStatus::Active,
            run_count: 0,
            max_runs: config.max_runs,
            last_run: None,
            created_at: now,
            inserted: Vec::new(),
        }
    }

    /// Run ceiling after applying the policy's own limit (`Once` runs once).
    pub fn effective_max_runs(&self) -> Option<u32> {
        match (&self.policy, self.max_runs) {
            (SchedulePolicy::Once { .. }, Some(max)) => Some(max.min(1)),
            (SchedulePolicy::Once { .. }, None) => Some(1),
            (_, max) => max,
        }
    }

    /// Whether the run ceiling has been reached.
    pub fn ceiling_reached(&self) -> bool {
        self.effective_max_runs()
            .map_or(false, |max| self.run_count >= max)
    }

    /// Whether an activation right now may insert a task.
    pub fn can_run(&self) -> bool {
        self.status == ScheduleStatus::Active && !self.ceiling_reached()
    }

    /// Record a successful insertion. Returns `true` if this run reached the
    /// ceiling, in which case the status is now `Completed`.
    pub fn record_run(&mut self, task_id: TaskId, now: Time) -> bool {
        self.run_count += 1;
        self.last_run = Some(now);
        self.inserted.push(task_id);
        if self.inserted.len() > INSERTED_HISTORY {
            let excess = self.inserted.len() - INSERTED_HISTORY;
            self.inserted.drain(..excess);
        }
        self.next_run = match &self.policy {
            SchedulePolicy::Interval { every } => Some(advance(now, *every)),
            _ => None,
        };

        if self.ceiling_reached() {
            self.status = ScheduleStatus::Completed;
            self.next_run = None;
            return true;
        }
        false
    }
}
