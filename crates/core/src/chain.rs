//! Task chain model - ordered, branchable pipelines of queue tasks.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::id::{ChainId, StepId};
use crate::predicate::Predicate;
use crate::task::TaskSpec;
use crate::Time;

/// Condition for running a step, evaluated against the previous step's result.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepCondition {
    /// Always run
    Always,

    /// Run only if the previous step succeeded
    IfSuccess,

    /// Run only if the previous step failed
    IfFailure,

    /// Run only if the previous output contains a substring
    IfOutputContains(String),

    /// Run only if the previous output matches a regular expression
    IfOutputMatches(String),

    /// Caller-supplied predicate
    Custom(Predicate<ChainStepResult>),
}

impl StepCondition {
    /// Build a `Custom` condition from a closure.
    pub fn custom(f: impl Fn(&ChainStepResult) -> bool + Send + Sync + 'static) -> Self {
        StepCondition::Custom(Predicate::new(f))
    }

    /// Evaluate against the previous result.
    ///
    /// An invalid `IfOutputMatches` pattern never matches.
    pub fn evaluate(&self, previous: &ChainStepResult) -> bool {
        match self {
            StepCondition::Always => true,
            StepCondition::IfSuccess => previous.status == StepOutcome::Success,
            StepCondition::IfFailure => previous.status == StepOutcome::Failure,
            StepCondition::IfOutputContains(needle) => previous.output_text().contains(needle.as_str()),
            StepCondition::IfOutputMatches(pattern) => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(&previous.output_text()),
                Err(e) => {
                    tracing::warn!("Invalid step condition pattern {:?}: {}", pattern, e);
                    false
                }
            },
            StepCondition::Custom(predicate) => predicate.test(previous),
        }
    }
}

/// One node in a chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStep {
    /// Identifier, unique within the chain
    pub id: StepId,

    /// Step name
    pub name: String,

    /// Task enqueued when the step runs
    pub task: TaskSpec,

    /// Run condition
    pub condition: Option<StepCondition>,

    /// Explicit next step on success
    pub on_success: Option<StepId>,

    /// Explicit next step on failure
    pub on_failure: Option<StepId>,

    /// Whether to retry a failed attempt
    pub retry_on_failure: bool,

    /// Retries allowed after the first attempt
    pub max_retries: u32,
}

impl ChainStep {
    /// Create a step that runs unconditionally with no retries.
    pub fn new(id: impl Into<StepId>, task: TaskSpec) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            task,
            condition: None,
            on_success: None,
            on_failure: None,
            retry_on_failure: false,
            max_retries: 0,
        }
    }

    /// Set name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set run condition.
    pub fn when(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Branch to `step` on success.
    pub fn on_success(mut self, step: impl Into<StepId>) -> Self {
        self.on_success = Some(step.into());
        self
    }

    /// Branch to `step` on failure.
    pub fn on_failure(mut self, step: impl Into<StepId>) -> Self {
        self.on_failure = Some(step.into());
        self
    }

    /// Retry failed attempts up to `max_retries` times.
    pub fn retry(mut self, max_retries: u32) -> Self {
        self.retry_on_failure = true;
        self.max_retries = max_retries;
        self
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Task completed
    Success,
    /// Task failed, timed out, or exhausted its retries
    Failure,
    /// Condition evaluated false
    Skipped,
}

/// Immutable record of one step's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStepResult {
    /// Step that produced this result
    pub step_id: StepId,

    /// Outcome
    pub status: StepOutcome,

    /// Task output
    pub output: Option<Value>,

    /// Error message
    pub error: Option<String>,

    /// Time spent, across all attempts
    pub duration: Duration,

    /// When the result was recorded
    pub timestamp: Time,

    /// Execution attempts (0 when skipped)
    pub attempts: u32,
}

impl ChainStepResult {
    /// Record a skipped step.
    pub fn skipped(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepOutcome::Skipped,
            output: None,
            error: None,
            duration: Duration::ZERO,
            timestamp: chrono::Utc::now(),
            attempts: 0,
        }
    }

    /// String form of the output used by text conditions.
    pub fn output_text(&self) -> String {
        match &self.output {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Chain status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Created, not started
    Pending,
    /// Executing steps
    Running,
    /// Every result succeeded
    Completed,
    /// At least one result did not succeed
    Failed,
    /// Cancelled while running
    Paused,
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStatus::Pending => write!(f, "pending"),
            ChainStatus::Running => write!(f, "running"),
            ChainStatus::Completed => write!(f, "completed"),
            ChainStatus::Failed => write!(f, "failed"),
            ChainStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Registration request for a chain.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    /// Chain name
    pub name: String,
    /// Description
    pub description: String,
    /// Ordered steps
    pub steps: Vec<ChainStep>,
}

impl ChainConfig {
    /// Create an empty chain config.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Append a step.
    pub fn step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// An ordered, branchable pipeline of steps sharing one execution context.
#[derive(Debug, Clone, Serialize)]
pub struct TaskChain {
    /// Unique identifier
    pub id: ChainId,

    /// Chain name
    pub name: String,

    /// Description
    pub description: String,

    /// Ordered steps, immutable after creation
    pub steps: Vec<ChainStep>,

    /// Current status
    pub status: ChainStatus,

    /// Index of the step currently executing
    pub current_step: usize,

    /// Results in execution order
    pub results: Vec<ChainStepResult>,

    /// Creation timestamp
    pub created_at: Time,

    /// When `start` was called
    pub started_at: Option<Time>,

    /// When the chain finished
    pub completed_at: Option<Time>,
}

impl TaskChain {
    /// Create a pending chain. Structural validation is the executor's job.
    pub fn new(config: ChainConfig) -> Self {
        Self {
            id: ChainId::new(),
            name: config.name,
            description: config.description,
            steps: config.steps,
            status: ChainStatus::Pending,
            current_step: 0,
            results: Vec::new(),
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Index of the step with `id`.
    pub fn step_index(&self, id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == id)
    }

    /// Index of the step to run after `index` produced `outcome`.
    ///
    /// Explicit pointers win; otherwise the next index. Skipped steps always
    /// advance to the next index.
    pub fn next_index(&self, index: usize, outcome: StepOutcome) -> Option<usize> {
        let step = self.steps.get(index)?;
        let pointer = match outcome {
            StepOutcome::Success => step.on_success.as_ref(),
            StepOutcome::Failure => step.on_failure.as_ref(),
            StepOutcome::Skipped => None,
        };
        let next = match pointer {
            Some(id) => self.step_index(id)?,
            None => index + 1,
        };
        (next < self.steps.len()).then_some(next)
    }

    /// Whether every recorded result succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status == StepOutcome::Success)
    }

    /// Whether another result may be recorded.
    pub fn has_capacity(&self) -> bool {
        self.results.len() < self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn step(id: &str) -> ChainStep {
        ChainStep::new(id, TaskSpec::new(TaskType::Custom, id))
    }

    fn result(status: StepOutcome, output: Option<Value>) -> ChainStepResult {
        ChainStepResult {
            step_id: "prev".into(),
            status,
            output,
            error: None,
            duration: Duration::from_millis(5),
            timestamp: chrono::Utc::now(),
            attempts: 1,
        }
    }

    #[test]
    fn test_status_conditions() {
        let ok = result(StepOutcome::Success, None);
        let failed = result(StepOutcome::Failure, None);

        assert!(StepCondition::Always.evaluate(&failed));
        assert!(StepCondition::IfSuccess.evaluate(&ok));
        assert!(!StepCondition::IfSuccess.evaluate(&failed));
        assert!(StepCondition::IfFailure.evaluate(&failed));
        assert!(!StepCondition::IfFailure.evaluate(&result(StepOutcome::Skipped, None)));
    }

    #[test]
    fn test_output_conditions() {
        let prev = result(
            StepOutcome::Success,
            Some(serde_json::json!({"stdout": "tests passed: 12"})),
        );

        assert!(StepCondition::IfOutputContains("passed".into()).evaluate(&prev));
        assert!(!StepCondition::IfOutputContains("failed".into()).evaluate(&prev));
        assert!(StepCondition::IfOutputMatches(r"passed: \d+".into()).evaluate(&prev));
        assert!(!StepCondition::IfOutputMatches("(unclosed".into()).evaluate(&prev));
    }

    #[test]
    fn test_output_text_of_plain_string_is_unquoted() {
        let prev = result(StepOutcome::Success, Some(Value::String("done".into())));
        assert_eq!(prev.output_text(), "done");
        assert_eq!(result(StepOutcome::Success, None).output_text(), "");
    }

    #[test]
    fn test_custom_condition() {
        let cond = StepCondition::custom(|r| r.attempts > 1);
        assert!(!cond.evaluate(&result(StepOutcome::Success, None)));
    }

    #[test]
    fn test_default_forward_linking() {
        let chain = TaskChain::new(
            ChainConfig::new("linear").step(step("a")).step(step("b")).step(step("c")),
        );

        assert_eq!(chain.next_index(0, StepOutcome::Success), Some(1));
        assert_eq!(chain.next_index(1, StepOutcome::Failure), Some(2));
        assert_eq!(chain.next_index(2, StepOutcome::Success), None);
    }

    #[test]
    fn test_explicit_pointers() {
        let chain = TaskChain::new(
            ChainConfig::new("branchy")
                .step(step("build").on_success("deploy").on_failure("notify"))
                .step(step("notify"))
                .step(step("deploy")),
        );

        assert_eq!(chain.next_index(0, StepOutcome::Success), Some(2));
        assert_eq!(chain.next_index(0, StepOutcome::Failure), Some(1));
        assert_eq!(chain.next_index(0, StepOutcome::Skipped), Some(1));
    }

    #[test]
    fn test_skipped_result_has_zero_duration() {
        let skipped = ChainStepResult::skipped("x".into());
        assert_eq!(skipped.status, StepOutcome::Skipped);
        assert_eq!(skipped.duration, Duration::ZERO);
        assert_eq!(skipped.attempts, 0);
    }
}
