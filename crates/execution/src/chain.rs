//! Task chain executor - runs chain steps one at a time through the queue.

use conductor_core::{
    ChainConfig, ChainId, ChainStatus, ChainStep, ChainStepResult, EventKind, StepId, StepOutcome,
    TaskChain, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::queue::TaskQueue;

/// Errors raised by chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// No such chain
    #[error("chain not found: {0}")]
    NotFound(ChainId),

    /// The chain's structure is unusable
    #[error("invalid chain: {0}")]
    InvalidChain(String),

    /// `start_chain` on a chain that already ran or is running
    #[error("chain {id} already started ({status})")]
    AlreadyStarted {
        /// Chain
        id: ChainId,
        /// Its status
        status: ChainStatus,
    },
}

/// Result alias for chain operations.
pub type Result<T> = std::result::Result<T, ChainError>;

/// Timing settings for chain steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    /// How long a step attempt may wait for its task, in milliseconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,

    /// Base of the linear retry backoff, in milliseconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_step_timeout() -> u64 {
    300_000
}

fn default_retry_base_delay() -> u64 {
    1000
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl ChainSettings {
    /// Set the step timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the retry base delay.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Step timeout as a duration.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Runs task chains step by step through the queue.
#[derive(Clone)]
pub struct ChainExecutor {
    queue: TaskQueue,
    events: EventBus,
    settings: ChainSettings,
    chains: Arc<Mutex<HashMap<ChainId, TaskChain>>>,
}

impl ChainExecutor {
    /// Create an executor feeding `queue`.
    pub fn new(queue: TaskQueue, events: EventBus) -> Self {
        Self {
            queue,
            events,
            settings: ChainSettings::default(),
            chains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the timing settings.
    pub fn with_settings(mut self, settings: ChainSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a chain. Steps without pointers fall through to the next index.
    pub async fn create_chain(&self, config: ChainConfig) -> Result<ChainId> {
        validate(&config.steps)?;
        let chain = TaskChain::new(config);
        let id = chain.id;

        info!("Created chain {} '{}' with {} steps", id, chain.name, chain.steps.len());
        self.events.emit(EventKind::ChainCreated {
            chain_id: id,
            name: chain.name.clone(),
            steps: chain.steps.len(),
        });

        self.chains.lock().await.insert(id, chain);
        Ok(id)
    }

    /// Run a pending chain to the end and return its results in execution order.
    pub async fn start_chain(&self, id: ChainId) -> Result<Vec<ChainStepResult>> {
        let plan = {
            let mut chains = self.chains.lock().await;
            let chain = chains.get_mut(&id).ok_or(ChainError::NotFound(id))?;
            if chain.status != ChainStatus::Pending {
                return Err(ChainError::AlreadyStarted {
                    id,
                    status: chain.status,
                });
            }
            chain.status = ChainStatus::Running;
            chain.started_at = Some(chrono::Utc::now());
            chain.clone()
        };
        info!("Starting chain {} '{}'", id, plan.name);

        let mut results: Vec<ChainStepResult> = Vec::new();
        let mut next = (!plan.steps.is_empty()).then_some(0);

        while let Some(index) = next {
            if results.len() >= plan.steps.len() {
                warn!("Chain {} hit its step budget, stopping", id);
                break;
            }
            if !self.mark_step(id, index).await {
                debug!("Chain {} is no longer running, not starting step {}", id, index);
                break;
            }

            let step = &plan.steps[index];
            let result = match results.last() {
                Some(previous) if step.condition.as_ref().map_or(false, |c| !c.evaluate(previous)) => {
                    debug!("Chain {} skipping step '{}'", id, step.id);
                    ChainStepResult::skipped(step.id.clone())
                }
                _ => self.run_step(id, index, step).await,
            };

            next = plan.next_index(index, result.status);
            self.record(id, &result).await;
            results.push(result);
        }

        self.finish(id, results.len()).await;
        Ok(results)
    }

    /// Stop a running chain after its in-flight step. Returns `false` if the
    /// chain was not running.
    pub async fn cancel_chain(&self, id: ChainId) -> Result<bool> {
        let mut chains = self.chains.lock().await;
        let chain = chains.get_mut(&id).ok_or(ChainError::NotFound(id))?;
        if chain.status != ChainStatus::Running {
            return Ok(false);
        }
        chain.status = ChainStatus::Paused;
        info!("Paused chain {} at step {}", id, chain.current_step);
        Ok(true)
    }

    /// Snapshot of a chain.
    pub async fn get_chain(&self, id: ChainId) -> Option<TaskChain> {
        self.chains.lock().await.get(&id).cloned()
    }

    /// Snapshot of every chain, oldest first.
    pub async fn list_chains(&self) -> Vec<TaskChain> {
        let chains = self.chains.lock().await;
        let mut all: Vec<_> = chains.values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        all
    }

    /// Execute one step, retrying failures while the budget allows.
    async fn run_step(&self, chain_id: ChainId, index: usize, step: &ChainStep) -> ChainStepResult {
        let started = Instant::now();
        let max_attempts = if step.retry_on_failure {
            step.max_retries.saturating_add(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.events.emit(EventKind::ChainStepStarted {
                chain_id,
                step_id: step.id.clone(),
                index,
                attempt,
            });
            debug!("Chain {} step '{}' attempt {}/{}", chain_id, step.id, attempt, max_attempts);

            match self.attempt(step).await {
                Ok(output) => {
                    return ChainStepResult {
                        step_id: step.id.clone(),
                        status: StepOutcome::Success,
                        output,
                        error: None,
                        duration: started.elapsed(),
                        timestamp: chrono::Utc::now(),
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if attempt < max_attempts && self.is_running(chain_id).await {
                        let delay = self.settings.backoff(attempt);
                        warn!(
                            "Chain {} step '{}' failed ({}), retrying in {:?}",
                            chain_id, step.id, error, delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    warn!("Chain {} step '{}' failed: {}", chain_id, step.id, error);
                    return ChainStepResult {
                        step_id: step.id.clone(),
                        status: StepOutcome::Failure,
                        output: None,
                        error: Some(error),
                        duration: started.elapsed(),
                        timestamp: chrono::Utc::now(),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// Enqueue the step's task once and wait for it.
    async fn attempt(&self, step: &ChainStep) -> std::result::Result<Option<Value>, String> {
        let mut spec = step.task.clone();
        spec.id = None;

        let task_id = self.queue.enqueue(spec).await.map_err(|e| e.to_string())?;
        let task = self
            .queue
            .wait_for(task_id, self.settings.step_timeout())
            .await
            .map_err(|e| e.to_string())?;

        match task.status {
            TaskStatus::Completed => Ok(task.output.map(Value::Object)),
            _ => Err(task.error.unwrap_or_else(|| format!("task {} failed", task.id))),
        }
    }

    /// Point the chain at `index`. Returns `false` if it was cancelled.
    async fn mark_step(&self, id: ChainId, index: usize) -> bool {
        let mut chains = self.chains.lock().await;
        match chains.get_mut(&id) {
            Some(chain) if chain.status == ChainStatus::Running => {
                chain.current_step = index;
                true
            }
            _ => false,
        }
    }

    async fn is_running(&self, id: ChainId) -> bool {
        let chains = self.chains.lock().await;
        chains.get(&id).map_or(false, |c| c.status == ChainStatus::Running)
    }

    async fn record(&self, id: ChainId, result: &ChainStepResult) {
        if let Some(chain) = self.chains.lock().await.get_mut(&id) {
            if chain.has_capacity() {
                chain.results.push(result.clone());
            }
        }
        self.events.emit(EventKind::ChainStepCompleted {
            chain_id: id,
            step_id: result.step_id.clone(),
            status: result.status,
        });
    }

    async fn finish(&self, id: ChainId, steps_run: usize) {
        let mut chains = self.chains.lock().await;
        let Some(chain) = chains.get_mut(&id) else {
            return;
        };
        chain.completed_at = Some(chrono::Utc::now());

        if chain.status == ChainStatus::Paused {
            info!("Chain {} stopped after {} steps", id, steps_run);
            return;
        }

        if chain.all_succeeded() {
            chain.status = ChainStatus::Completed;
            info!("Chain {} completed ({} steps)", id, steps_run);
            self.events.emit(EventKind::ChainCompleted { chain_id: id, steps_run });
        } else {
            chain.status = ChainStatus::Failed;
            info!("Chain {} failed ({} steps)", id, steps_run);
            self.events.emit(EventKind::ChainFailed { chain_id: id, steps_run });
        }
    }
}

/// Reject empty chains, duplicate step ids and dangling branch pointers.
fn validate(steps: &[ChainStep]) -> Result<()> {
    if steps.is_empty() {
        return Err(ChainError::InvalidChain("chain has no steps".into()));
    }

    let mut ids: HashSet<&StepId> = HashSet::new();
    for step in steps {
        if !ids.insert(&step.id) {
            return Err(ChainError::InvalidChain(format!("duplicate step id '{}'", step.id)));
        }
    }

    for step in steps {
        for target in [&step.on_success, &step.on_failure].into_iter().flatten() {
            if !ids.contains(target) {
                return Err(ChainError::InvalidChain(format!(
                    "step '{}' points at unknown step '{}'",
                    step.id, target
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionEngine;
    use crate::handler::{handler_fn, HandlerError, HandlerRegistry};
    use conductor_core::{Payload, StepCondition, Task, TaskSpec, TaskType};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Tasks whose input has `"fail": true` fail; others echo their description.
    async fn setup(settings: ChainSettings) -> (ChainExecutor, ExecutionEngine, EventBus) {
        let events = EventBus::default();
        let queue = TaskQueue::new(events.clone());
        let engine = ExecutionEngine::new(
            queue.clone(),
            HandlerRegistry::new().with_fallback(handler_fn(|task: Task| async move {
                if task.input.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                    return Err(HandlerError::failed(format!("{} broke", task.description)));
                }
                let mut out = Payload::new();
                out.insert("echo".into(), Value::String(task.description.clone()));
                Ok(out)
            })),
        );
        engine.start().await;
        (ChainExecutor::new(queue, events.clone()).with_settings(settings), engine, events)
    }

    fn ok_step(id: &str) -> ChainStep {
        ChainStep::new(id, TaskSpec::new(TaskType::Custom, id))
    }

    fn failing_step(id: &str) -> ChainStep {
        ChainStep::new(id, TaskSpec::new(TaskType::Custom, id).with_input("fail", true))
    }

    fn order(results: &[ChainStepResult]) -> Vec<&str> {
        results.iter().map(|r| r.step_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_default_linking_runs_in_order() {
        let (executor, engine, events) = setup(ChainSettings::default()).await;
        let id = executor
            .create_chain(
                ChainConfig::new("linear")
                    .step(ok_step("fetch"))
                    .step(ok_step("parse"))
                    .step(ok_step("store")),
            )
            .await
            .unwrap();

        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(order(&results), vec!["fetch", "parse", "store"]);
        assert!(results.iter().all(|r| r.status == StepOutcome::Success));
        assert_eq!(results[1].output_text(), r#"{"echo":"parse"}"#);

        let chain = executor.get_chain(id).await.unwrap();
        assert_eq!(chain.status, ChainStatus::Completed);
        assert_eq!(chain.results.len(), 3);
        assert!(chain.completed_at.is_some());

        let names = events.history_names();
        assert!(names.contains(&"chain:created"));
        assert_eq!(names.iter().filter(|n| **n == "chain:step_started").count(), 3);
        assert!(names.contains(&"chain:completed"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_condition_false_records_skip() {
        let (executor, engine, _) = setup(ChainSettings::default()).await;
        let id = executor
            .create_chain(
                ChainConfig::new("guarded")
                    .step(failing_step("build"))
                    .step(ok_step("deploy").when(StepCondition::IfSuccess)),
            )
            .await
            .unwrap();

        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, StepOutcome::Failure);
        assert_eq!(results[0].error.as_deref(), Some("build broke"));
        assert_eq!(results[1].status, StepOutcome::Skipped);
        assert_eq!(results[1].duration, Duration::ZERO);
        assert_eq!(results[1].attempts, 0);

        assert_eq!(executor.get_chain(id).await.unwrap().status, ChainStatus::Failed);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_unconditioned_step_runs_after_failure() {
        let (executor, engine, _) = setup(ChainSettings::default()).await;
        let id = executor
            .create_chain(
                ChainConfig::new("cleanup")
                    .step(failing_step("build"))
                    .step(ok_step("cleanup")),
            )
            .await
            .unwrap();

        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(order(&results), vec!["build", "cleanup"]);
        assert_eq!(results[0].status, StepOutcome::Failure);
        assert_eq!(results[1].status, StepOutcome::Success);
        assert_eq!(results[1].attempts, 1);
        engine.stop().await;
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let settings = ChainSettings::default()
            .with_step_timeout(Duration::MAX)
            .with_retry_base_delay(Duration::MAX);
        assert_eq!(settings.step_timeout_ms, u64::MAX);
        assert_eq!(settings.retry_base_delay_ms, u64::MAX);
    }

    #[tokio::test]
    async fn test_first_step_ignores_its_condition() {
        let (executor, engine, _) = setup(ChainSettings::default()).await;
        let id = executor
            .create_chain(ChainConfig::new("solo").step(ok_step("only").when(StepCondition::IfFailure)))
            .await
            .unwrap();

        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(results[0].status, StepOutcome::Success);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_makes_exactly_three_attempts() {
        let events = EventBus::default();
        let queue = TaskQueue::new(events.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let engine = ExecutionEngine::new(
            queue.clone(),
            HandlerRegistry::new().with_fallback(handler_fn(move |_task: Task| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Payload, _>(HandlerError::failed("still down"))
                }
            })),
        );
        engine.start().await;
        let executor = ChainExecutor::new(queue, events.clone());

        let id = executor
            .create_chain(ChainConfig::new("flaky").step(ok_step("call").retry(2)))
            .await
            .unwrap();

        let began = tokio::time::Instant::now();
        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, StepOutcome::Failure);
        assert_eq!(results[0].attempts, 3);
        // 1s + 2s of linear backoff
        assert!(began.elapsed() >= Duration::from_secs(3));

        let started: Vec<_> = events
            .history()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::ChainStepStarted { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![1, 2, 3]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_branch_pointers() {
        let (executor, engine, _) = setup(ChainSettings::default()).await;
        let id = executor
            .create_chain(
                ChainConfig::new("branching")
                    .step(failing_step("check").on_success("happy").on_failure("repair"))
                    .step(ok_step("happy"))
                    .step(ok_step("repair").on_success("report"))
                    .step(ok_step("unused"))
                    .step(ok_step("report")),
            )
            .await
            .unwrap();

        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(order(&results), vec!["check", "repair", "report"]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_branch_loop_is_bounded() {
        let (executor, engine, _) = setup(ChainSettings::default()).await;
        let id = executor
            .create_chain(
                ChainConfig::new("loop")
                    .step(ok_step("a").on_success("b"))
                    .step(ok_step("b").on_success("a")),
            )
            .await
            .unwrap();

        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(order(&results), vec!["a", "b"]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_step_timeout_is_a_failure() {
        let events = EventBus::default();
        let queue = TaskQueue::new(events.clone());
        // No engine: the step's task is never dispatched.
        let executor = ChainExecutor::new(queue, events)
            .with_settings(ChainSettings::default().with_step_timeout(Duration::from_millis(20)));

        let id = executor
            .create_chain(ChainConfig::new("stuck").step(ok_step("wait")))
            .await
            .unwrap();
        let results = executor.start_chain(id).await.unwrap();
        assert_eq!(results[0].status, StepOutcome::Failure);
        assert!(results[0].error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_stops_after_current_step() {
        let events = EventBus::default();
        let queue = TaskQueue::new(events.clone());
        let executor = ChainExecutor::new(queue.clone(), events);
        let id = executor
            .create_chain(ChainConfig::new("long").step(ok_step("one")).step(ok_step("two")))
            .await
            .unwrap();

        let runner = executor.clone();
        let handle = tokio::spawn(async move { runner.start_chain(id).await });

        // Wait for step one's task to show up, then cancel before it runs.
        let mut task = None;
        for _ in 0..100 {
            task = queue.state().await.pending.first().map(|t| t.id);
            if task.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let task = task.expect("step task enqueued");
        assert!(executor.cancel_chain(id).await.unwrap());
        assert!(!executor.cancel_chain(id).await.unwrap());

        let engine = ExecutionEngine::new(
            queue.clone(),
            HandlerRegistry::new().with_fallback(handler_fn(|_task: Task| async { Ok(Payload::new()) })),
        );
        engine.run_cycle().await;
        queue.wait_for(task, Duration::from_secs(5)).await.unwrap();

        let results = handle.await.unwrap().unwrap();
        assert_eq!(order(&results), vec!["one"]);
        assert_eq!(executor.get_chain(id).await.unwrap().status, ChainStatus::Paused);
        assert!(queue.state().await.pending.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_and_unknown() {
        let (executor, engine, _) = setup(ChainSettings::default()).await;
        let id = executor
            .create_chain(ChainConfig::new("once").step(ok_step("x")))
            .await
            .unwrap();
        executor.start_chain(id).await.unwrap();

        assert!(matches!(
            executor.start_chain(id).await,
            Err(ChainError::AlreadyStarted { status: ChainStatus::Completed, .. })
        ));
        assert!(matches!(
            executor.start_chain(ChainId::new()).await,
            Err(ChainError::NotFound(_))
        ));
        assert!(matches!(
            executor.cancel_chain(ChainId::new()).await,
            Err(ChainError::NotFound(_))
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_chains_are_rejected() {
        let (executor, engine, _) = setup(ChainSettings::default()).await;

        let empty = executor.create_chain(ChainConfig::new("empty")).await;
        assert!(matches!(empty, Err(ChainError::InvalidChain(_))));

        let dup = executor
            .create_chain(ChainConfig::new("dup").step(ok_step("a")).step(ok_step("a")))
            .await;
        assert!(matches!(dup, Err(ChainError::InvalidChain(_))));

        let dangling = executor
            .create_chain(ChainConfig::new("dangling").step(ok_step("a").on_failure("nowhere")))
            .await;
        assert!(matches!(dangling, Err(ChainError::InvalidChain(_))));

        assert!(executor.list_chains().await.is_empty());
        engine.stop().await;
    }
}
