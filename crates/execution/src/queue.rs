//! The task queue - owns every task from enqueue to terminal state.

use conductor_core::{CoreError, EventKind, Payload, Task, TaskId, TaskSpec, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::dependency::{DependencyResolver, Resolution};
use crate::events::EventBus;
use crate::selector::{Candidate, TaskSelector};

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A preallocated id is already in use
    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    /// The new task would close a dependency cycle
    #[error("dependency cycle detected: {0:?}")]
    DependencyCycle(Vec<TaskId>),

    /// No such task
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The task did not terminate within the wait budget
    #[error("timed out after {timeout:?} waiting for task {task}")]
    WaitTimeout {
        /// Task waited on
        task: TaskId,
        /// Budget that elapsed
        timeout: Duration,
    },

    /// Illegal status change
    #[error(transparent)]
    Transition(#[from] CoreError),
}

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Point-in-time view of the queue, each list in insertion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    /// Waiting tasks
    pub pending: Vec<Task>,
    /// Dispatched tasks
    pub running: Vec<Task>,
    /// Tasks that produced output
    pub completed: Vec<Task>,
    /// Tasks that failed
    pub failed: Vec<Task>,
}

impl QueueSnapshot {
    /// Total number of tasks.
    pub fn len(&self) -> usize {
        self.pending.len() + self.running.len() + self.completed.len() + self.failed.len()
    }

    /// Whether the queue held no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    /// Insertion order; a task's index is its FIFO sequence number
    order: Vec<TaskId>,
    /// Completion futures keyed by task
    waiters: HashMap<TaskId, Vec<oneshot::Sender<Task>>>,
}

/// Shared, cloneable handle to the task queue.
#[derive(Clone)]
pub struct TaskQueue {
    state: Arc<Mutex<QueueState>>,
    resolver: DependencyResolver,
    events: EventBus,
    work: Arc<Notify>,
}

impl TaskQueue {
    /// Create an empty queue publishing on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            resolver: DependencyResolver::new(),
            events,
            work: Arc::new(Notify::new()),
        }
    }

    /// Append a pending task and emit `task:added`.
    pub async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId> {
        let task = Task::from_spec(spec);
        let id = task.id;

        {
            let mut state = self.state.lock().await;
            if state.tasks.contains_key(&id) {
                return Err(QueueError::DuplicateTask(id));
            }
            if let Some(cycle) = self.resolver.find_cycle(&state.tasks, &task) {
                warn!("Rejected task {}: dependency cycle {:?}", id, cycle);
                return Err(QueueError::DependencyCycle(cycle));
            }

            info!("Enqueued task {} [{} / {:?}] {}", id, task.task_type, task.priority, task.description);
            self.events.emit(EventKind::TaskAdded {
                task_id: id,
                task_type: task.task_type,
                priority: task.priority,
            });
            state.order.push(id);
            state.tasks.insert(id, task);
        }

        self.work.notify_one();
        Ok(id)
    }

    /// Clone of one task.
    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    /// Point-in-time snapshot grouped by status.
    pub async fn state(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = QueueSnapshot::default();

        for task in state.order.iter().filter_map(|id| state.tasks.get(id)) {
            let bucket = match task.status {
                TaskStatus::Pending => &mut snapshot.pending,
                TaskStatus::Running => &mut snapshot.running,
                TaskStatus::Completed => &mut snapshot.completed,
                TaskStatus::Failed => &mut snapshot.failed,
            };
            bucket.push(task.clone());
        }

        snapshot
    }

    /// Wait until the task is terminal, or fail after `timeout`.
    pub async fn wait_for(&self, id: TaskId, timeout: Duration) -> Result<Task> {
        let receiver = {
            let mut state = self.state.lock().await;
            match state.tasks.get(&id) {
                None => return Err(QueueError::NotFound(id)),
                Some(task) if task.is_terminal() => return Ok(task.clone()),
                Some(_) => {}
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.entry(id).or_default().push(sender);
            receiver
        };

        let outcome = tokio::time::timeout(timeout, receiver).await;
        match outcome {
            Ok(Ok(task)) => Ok(task),
            // The sender only drops without sending if the queue itself went away.
            Ok(Err(_)) | Err(_) => {
                self.prune_waiters(id).await;
                Err(QueueError::WaitTimeout { task: id, timeout })
            }
        }
    }

    /// Drop senders whose waiter gave up.
    async fn prune_waiters(&self, id: TaskId) {
        let mut state = self.state.lock().await;
        if let Some(waiters) = state.waiters.get_mut(&id) {
            waiters.retain(|sender| !sender.is_closed());
            if waiters.is_empty() {
                state.waiters.remove(&id);
            }
        }
    }

    /// Pick the next ready task with `selector` and mark it running.
    pub(crate) async fn dispatch_next(&self, selector: &dyn TaskSelector) -> Option<Task> {
        let mut state = self.state.lock().await;

        let ready: Vec<Candidate> = state
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| state.tasks.get(id).map(|t| (seq, t)))
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .filter(|(_, t)| self.resolver.check(&state.tasks, t) == Resolution::Ready)
            .map(|(seq, t)| Candidate {
                id: t.id,
                priority: t.priority,
                seq: seq as u64,
            })
            .collect();

        let id = selector.select(&ready)?;
        let task = state.tasks.get_mut(&id)?;
        if let Err(e) = task.start() {
            warn!("Selector picked a task that cannot start: {}", e);
            return None;
        }
        debug!("Dispatching task {} ({} ready)", id, ready.len());
        Some(task.clone())
    }

    /// Record a handler outcome and wake anyone waiting on the task.
    pub(crate) async fn finish(
        &self,
        id: TaskId,
        outcome: std::result::Result<Payload, String>,
    ) -> Result<Task> {
        let finished = {
            let mut state = self.state.lock().await;
            let task = state.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;

            match outcome {
                Ok(output) => {
                    task.complete(output)?;
                    info!("Task {} completed", id);
                    self.events.emit(EventKind::TaskCompleted {
                        task_id: id,
                        task_type: task.task_type,
                    });
                }
                Err(error) => {
                    task.fail(error.clone())?;
                    warn!("Task {} failed: {}", id, error);
                    self.events.emit(EventKind::TaskFailed {
                        task_id: id,
                        task_type: task.task_type,
                        error,
                    });
                }
            }

            let task = task.clone();
            for waiter in state.waiters.remove(&id).unwrap_or_default() {
                let _ = waiter.send(task.clone());
            }
            task
        };

        // Dependents may have become ready.
        self.work.notify_one();
        Ok(finished)
    }

    /// Signalled whenever new work may be available.
    pub(crate) fn work_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.work)
    }
}
