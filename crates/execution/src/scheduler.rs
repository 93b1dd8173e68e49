//! Task scheduling - turns schedule policies into queue insertions.

use conductor_core::{
    EventKind, ScheduleConfig, SchedulePolicy, ScheduleStatus, ScheduledTask, ScheduledTaskId,
    TaskId, TaskStatus, Upstream,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::queue::TaskQueue;

/// Errors raised by scheduler operations.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No such scheduled task
    #[error("scheduled task not found: {0}")]
    NotFound(ScheduledTaskId),

    /// The policy or ceiling can never fire
    #[error("invalid schedule policy: {0}")]
    InvalidPolicy(String),

    /// The operation does not apply in the current status
    #[error("scheduled task {id} is {status}")]
    InvalidState {
        /// Scheduled task
        id: ScheduledTaskId,
        /// Its status
        status: ScheduleStatus,
    },
}

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, ScheduleError>;

/// What one activation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// A task was inserted; `finished` is set when the ceiling was reached
    Inserted {
        /// Inserted task
        task_id: TaskId,
        /// Whether this run completed the scheduled task
        finished: bool,
    },
    /// The scheduled task is not active or already at its ceiling
    Skipped,
    /// The queue rejected the insertion
    Failed(String),
}

struct Entry {
    scheduled: ScheduledTask,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<ScheduledTaskId, Entry>,
    /// Which scheduled task inserted which queue task
    origins: HashMap<TaskId, ScheduledTaskId>,
    running: bool,
    listener: Option<JoinHandle<()>>,
}

/// Converts schedule policies into queue insertions.
#[derive(Clone)]
pub struct TaskScheduler {
    queue: TaskQueue,
    events: EventBus,
    state: Arc<Mutex<SchedulerState>>,
}

impl TaskScheduler {
    /// Create a stopped scheduler feeding `queue`.
    pub fn new(queue: TaskQueue, events: EventBus) -> Self {
        Self {
            queue,
            events,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    /// Register a scheduled task.
    ///
    /// Timers are armed right away if the scheduler is running, otherwise on
    /// `start`.
    pub async fn schedule(&self, config: ScheduleConfig) -> Result<ScheduledTaskId> {
        validate(&config)?;
        let scheduled = ScheduledTask::new(config);
        let id = scheduled.id;
        info!(
            "Scheduled task {} '{}' ({:?}, max_runs={:?})",
            id, scheduled.name, scheduled.policy, scheduled.max_runs
        );

        let upstream = match scheduled.policy {
            SchedulePolicy::After {
                upstream: Upstream::Task(task_id),
                ..
            } => Some(task_id),
            _ => None,
        };

        {
            let mut state = self.state.lock().await;
            let timer = if state.running {
                self.arm(id, &scheduled.policy)
            } else {
                None
            };
            state.entries.insert(id, Entry { scheduled, timer });
        }

        // The upstream may have finished before this registration.
        if let Some(task_id) = upstream {
            if let Some(task) = self.queue.get(task_id).await {
                if task.is_terminal() {
                    self.on_task_finished(task_id, task.status, Some(id)).await;
                }
            }
        }

        Ok(id)
    }

    /// Pause a scheduled task and release its timer.
    pub async fn cancel_task(&self, id: ScheduledTaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entries.get_mut(&id).ok_or(ScheduleError::NotFound(id))?;

        match entry.scheduled.status {
            ScheduleStatus::Active => {
                entry.scheduled.status = ScheduleStatus::Paused;
                entry.scheduled.next_run = None;
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                info!("Paused scheduled task {}", id);
                Ok(())
            }
            ScheduleStatus::Paused => Ok(()),
            status => Err(ScheduleError::InvalidState { id, status }),
        }
    }

    /// Re-activate a paused scheduled task.
    pub async fn resume_task(&self, id: ScheduledTaskId) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let entry = state.entries.get_mut(&id).ok_or(ScheduleError::NotFound(id))?;

        match entry.scheduled.status {
            ScheduleStatus::Paused => {
                entry.scheduled.status = ScheduleStatus::Active;
                entry.scheduled.next_run = entry.scheduled.policy.first_run(chrono::Utc::now());
                if state.running {
                    entry.timer = self.arm(id, &entry.scheduled.policy);
                }
                info!("Resumed scheduled task {}", id);
                Ok(())
            }
            ScheduleStatus::Active => Ok(()),
            status => Err(ScheduleError::InvalidState { id, status }),
        }
    }

    /// Fire a named external event. Returns the tasks it inserted.
    pub async fn fire_trigger(&self, event: &str, payload: Value) -> Vec<TaskId> {
        let matching: Vec<_> = {
            let state = self.state.lock().await;
            state
                .entries
                .iter()
                .filter(|(_, e)| e.scheduled.status == ScheduleStatus::Active)
                .filter(|(_, e)| e.scheduled.policy.accepts_trigger(event, &payload))
                .map(|(id, _)| *id)
                .collect()
        };
        debug!("Trigger '{}' matched {} scheduled task(s)", event, matching.len());

        let mut inserted = Vec::new();
        for id in matching {
            if let Activation::Inserted { task_id, .. } = self.activate(id).await {
                inserted.push(task_id);
            }
        }
        inserted
    }

    /// Run one activation of a scheduled task.
    ///
    /// Insertion failures are reported as `scheduled_task:failed` and leave
    /// the scheduled task's status untouched.
    pub async fn activate(&self, id: ScheduledTaskId) -> Activation {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(&id) else {
            return Activation::Skipped;
        };
        if !entry.scheduled.can_run() {
            return Activation::Skipped;
        }

        let mut spec = entry.scheduled.task.clone();
        spec.id = None;

        match self.queue.enqueue(spec).await {
            Ok(task_id) => {
                let finished = entry.scheduled.record_run(task_id, chrono::Utc::now());
                state.origins.insert(task_id, id);
                info!(
                    "Scheduled task {} inserted task {} (run {})",
                    id, task_id, entry.scheduled.run_count
                );
                self.events.emit(EventKind::ScheduledTaskRunning {
                    scheduled_id: id,
                    task_id,
                    run_count: entry.scheduled.run_count,
                });

                if finished {
                    // Dropping the handle detaches the timer, which stops on its own.
                    entry.timer = None;
                    info!("Scheduled task {} completed after {} runs", id, entry.scheduled.run_count);
                    self.events.emit(EventKind::ScheduledTaskCompleted {
                        scheduled_id: id,
                        run_count: entry.scheduled.run_count,
                    });
                }
                Activation::Inserted { task_id, finished }
            }
            Err(e) => {
                warn!("Scheduled task {} could not insert its task: {}", id, e);
                self.events.emit(EventKind::ScheduledTaskFailed {
                    scheduled_id: id,
                    error: e.to_string(),
                });
                Activation::Failed(e.to_string())
            }
        }
    }

    /// Arm timers and start listening for task completions. Returns `false`
    /// if already running.
    pub async fn start(&self) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.running {
            return false;
        }
        state.running = true;

        for (id, entry) in state.entries.iter_mut() {
            if entry.scheduled.status == ScheduleStatus::Active && entry.timer.is_none() {
                entry.timer = self.arm(*id, &entry.scheduled.policy);
            }
        }

        let receiver = self.events.subscribe();
        let scheduler = self.clone();
        state.listener = Some(tokio::spawn(async move {
            scheduler.listen(receiver).await;
        }));

        info!("Scheduler started with {} scheduled task(s)", state.entries.len());
        true
    }

    /// Release every timer and the completion listener. Returns `false` if
    /// not running.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.running {
            return false;
        }
        state.running = false;

        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        for entry in state.entries.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        info!("Scheduler stopped");
        true
    }

    /// Snapshot of one scheduled task.
    pub async fn get(&self, id: ScheduledTaskId) -> Option<ScheduledTask> {
        let state = self.state.lock().await;
        state.entries.get(&id).map(|e| e.scheduled.clone())
    }

    /// Snapshot of every scheduled task, oldest first.
    pub async fn list(&self) -> Vec<ScheduledTask> {
        let state = self.state.lock().await;
        let mut all: Vec<_> = state.entries.values().map(|e| e.scheduled.clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Spawn the timer for a time-based policy.
    fn arm(&self, id: ScheduledTaskId, policy: &SchedulePolicy) -> Option<JoinHandle<()>> {
        let scheduler = self.clone();
        match policy {
            SchedulePolicy::Once { at } => {
                let delay = (*at - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!("Arming one-shot timer for {} in {:?}", id, delay);
                Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    scheduler.activate(id).await;
                }))
            }
            SchedulePolicy::Interval { every } => {
                let every = (*every).max(Duration::from_millis(1));
                debug!("Arming interval timer for {} every {:?}", id, every);
                Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        match scheduler.activate(id).await {
                            Activation::Inserted { finished: true, .. } | Activation::Skipped => break,
                            _ => {}
                        }
                    }
                }))
            }
            SchedulePolicy::Trigger { .. } | SchedulePolicy::After { .. } => None,
        }
    }

    async fn listen(&self, mut receiver: broadcast::Receiver<conductor_core::Event>) {
        loop {
            match receiver.recv().await {
                Ok(event) => match event.kind {
                    EventKind::TaskCompleted { task_id, .. } => {
                        self.on_task_finished(task_id, TaskStatus::Completed, None).await;
                    }
                    EventKind::TaskFailed { task_id, .. } => {
                        self.on_task_finished(task_id, TaskStatus::Failed, None).await;
                    }
                    _ => {}
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Scheduler missed {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Fire `After` policies watching a task that just terminated.
    ///
    /// With `only`, just that scheduled task is considered.
    async fn on_task_finished(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        only: Option<ScheduledTaskId>,
    ) {
        let (matching, exhausted) = {
            let mut state = self.state.lock().await;
            // The listener sees each terminal task once; catch-up lookups leave the entry.
            let origin = match only {
                None => state.origins.remove(&task_id),
                Some(_) => state.origins.get(&task_id).copied(),
            };
            let mut matching = Vec::new();
            let mut exhausted = Vec::new();

            for (id, entry) in &state.entries {
                if only.map_or(false, |o| o != *id) || entry.scheduled.status != ScheduleStatus::Active {
                    continue;
                }
                let SchedulePolicy::After { upstream, .. } = &entry.scheduled.policy else {
                    continue;
                };
                if entry.scheduled.policy.accepts_completion(task_id, origin, status) {
                    matching.push(*id);
                }
                // A concrete upstream task terminates only once.
                if *upstream == Upstream::Task(task_id) {
                    exhausted.push(*id);
                }
            }
            (matching, exhausted)
        };

        for id in matching {
            self.activate(id).await;
        }

        if exhausted.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for id in exhausted {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.scheduled.status != ScheduleStatus::Active {
                continue;
            }
            if entry.scheduled.run_count > 0 {
                entry.scheduled.status = ScheduleStatus::Completed;
                self.events.emit(EventKind::ScheduledTaskCompleted {
                    scheduled_id: id,
                    run_count: entry.scheduled.run_count,
                });
            } else {
                info!("Scheduled task {} can no longer fire: upstream {} ended {}", id, task_id, status);
                entry.scheduled.status = ScheduleStatus::Failed;
            }
        }
    }
}

fn validate(config: &ScheduleConfig) -> Result<()> {
    if config.max_runs == Some(0) {
        return Err(ScheduleError::InvalidPolicy("max_runs must be at least 1".into()));
    }
    match &config.policy {
        SchedulePolicy::Interval { every } if every.is_zero() => {
            Err(ScheduleError::InvalidPolicy("interval must be greater than zero".into()))
        }
        SchedulePolicy::Trigger { event, .. } if event.is_empty() => {
            Err(ScheduleError::InvalidPolicy("trigger event name is empty".into()))
        }
        _ => Ok(()),
    }
}
