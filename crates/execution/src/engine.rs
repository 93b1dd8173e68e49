//! The execution engine - runs the dispatch loop over the queue.

use conductor_core::{Task, TaskId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::handler::{HandlerError, HandlerRegistry};
use crate::queue::TaskQueue;
use crate::selector::{PrioritySelector, TaskSelector};

/// Configuration for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max handlers running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Time budget per task, in milliseconds
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Fallback wake-up interval of the idle loop, in milliseconds
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_idle_poll_ms() -> u64 {
    250
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_timeout_ms: default_task_timeout_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl EngineConfig {
    /// Set max concurrent handlers.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set time budget per task.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Time budget per task.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Idle wake-up interval.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

/// Result of a single execution cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleResult {
    /// A task was handed to its handler
    Dispatched(TaskId),
    /// No ready task
    NoTasks,
    /// Every handler slot is busy
    Saturated,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The main execution engine.
///
/// Runs the dispatch loop:
/// ```text
/// Select ready task → mark running → handler → completed | failed
/// ```
#[derive(Clone)]
pub struct ExecutionEngine {
    queue: TaskQueue,
    handlers: Arc<HandlerRegistry>,
    selector: Arc<dyn TaskSelector>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    runner: Arc<Mutex<Option<Runner>>>,
}

impl ExecutionEngine {
    /// Create a new execution engine.
    pub fn new(queue: TaskQueue, handlers: HandlerRegistry) -> Self {
        let config = EngineConfig::default();
        Self {
            queue,
            handlers: Arc::new(handlers),
            selector: Arc::new(PrioritySelector::default()),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            runner: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the task selector strategy.
    pub fn with_selector(mut self, selector: Arc<dyn TaskSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        self.config = config;
        self
    }

    /// Dispatch at most one ready task.
    ///
    /// The handler runs on its own tokio task; use `TaskQueue::wait_for` to
    /// observe the outcome.
    pub async fn run_cycle(&self) -> CycleResult {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return CycleResult::Saturated;
        };

        let Some(task) = self.queue.dispatch_next(self.selector.as_ref()).await else {
            return CycleResult::NoTasks;
        };

        let id = task.id;
        debug!("Selected task: {} - {}", id, task.description);
        self.spawn_handler(task, permit);
        CycleResult::Dispatched(id)
    }

    fn spawn_handler(&self, task: Task, permit: OwnedSemaphorePermit) {
        let queue = self.queue.clone();
        let handler = self.handlers.get(task.task_type);
        let budget = self.config.task_timeout();

        tokio::spawn(async move {
            info!("Executing task {} ({})", task.id, task.task_type);
            let outcome = match handler {
                None => Err(HandlerError::Missing(task.task_type)),
                Some(handler) => {
                    // A panicking handler unwinds its own task, not this one.
                    let attempt = task.clone();
                    let mut call = tokio::spawn(async move { handler.handle(&attempt).await });
                    match tokio::time::timeout(budget, &mut call).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => Err(HandlerError::failed(format!("handler panicked: {e}"))),
                        Err(_) => {
                            call.abort();
                            Err(HandlerError::Timeout(budget))
                        }
                    }
                }
            };

            // Release the slot before waking the loop through `finish`.
            drop(permit);
            if let Err(e) = queue.finish(task.id, outcome.map_err(|e| e.to_string())).await {
                error!("Could not record outcome of task {}: {}", task.id, e);
            }
        });
    }

    /// Start the background loop. Returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        let mut runner = self.runner.lock().await;
        if runner.as_ref().map_or(false, |r| !r.handle.is_finished()) {
            return false;
        }

        let (shutdown, mut stopped) = watch::channel(false);
        let engine = self.clone();
        let work = self.queue.work_signal();
        let idle = self.config.idle_poll();

        let handle = tokio::spawn(async move {
            info!("Execution loop started");
            loop {
                if *stopped.borrow() {
                    break;
                }
                match engine.run_cycle().await {
                    CycleResult::Dispatched(_) => continue,
                    CycleResult::NoTasks | CycleResult::Saturated => {
                        tokio::select! {
                            _ = work.notified() => {}
                            _ = tokio::time::sleep(idle) => {}
                            changed = stopped.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            info!("Execution loop stopped");
        });

        *runner = Some(Runner { shutdown, handle });
        true
    }

    /// Stop the background loop. In-flight handlers keep running and still
    /// record their outcome. Returns `false` if the loop was not running.
    pub async fn stop(&self) -> bool {
        let Some(runner) = self.runner.lock().await.take() else {
            return false;
        };

        let _ = runner.shutdown.send(true);
        if let Err(e) = runner.handle.await {
            error!("Execution loop ended abnormally: {}", e);
        }
        true
    }

    /// Whether the background loop is running.
    pub async fn is_running(&self) -> bool {
        self.runner
            .lock()
            .await
            .as_ref()
            .map_or(false, |r| !r.handle.is_finished())
    }

    /// The queue this engine drains.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Current configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
