//! The orchestrator context - owns and wires every component.

use conductor_core::{
    ChainConfig, ChainId, ChainStepResult, Event, Execution, ScheduleConfig, ScheduledTaskId, TaskId,
    TaskSpec,
};
use conductor_execution::{
    ChainError, ChainExecutor, EventBus, ExecutionEngine, HandlerRegistry, QueueError, ScheduleError,
    TaskQueue, TaskScheduler,
};
use conductor_reactive::{Reaction, ReactiveBridge};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::OrchestratorConfig;

/// Owns the queue, the dispatch loop, the scheduler, the chain executor and
/// the reactive bridge, all sharing one event bus.
///
/// Components are cheap handles; clone them out with the accessors to use
/// them from other tasks.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    events: EventBus,
    queue: TaskQueue,
    engine: ExecutionEngine,
    scheduler: TaskScheduler,
    chains: ChainExecutor,
    bridge: ReactiveBridge,
}

impl Orchestrator {
    /// Build a stopped orchestrator.
    pub fn new(config: OrchestratorConfig, handlers: HandlerRegistry) -> Self {
        let events = EventBus::new(&config.events);
        let queue = TaskQueue::new(events.clone());
        let engine = ExecutionEngine::new(queue.clone(), handlers).with_config(config.engine.clone());
        let scheduler = TaskScheduler::new(queue.clone(), events.clone());
        let chains =
            ChainExecutor::new(queue.clone(), events.clone()).with_settings(config.chains.clone());
        let bridge = ReactiveBridge::new(queue.clone(), events.clone());

        Self {
            config,
            events,
            queue,
            engine,
            scheduler,
            chains,
            bridge,
        }
    }

    /// Start the dispatch loop and the scheduler's timers.
    pub async fn start(&self) {
        self.engine.start().await;
        self.scheduler.start().await;
        info!("Orchestrator started");
    }

    /// Stop the scheduler first so nothing new arrives, then the loop.
    ///
    /// Running handlers finish on their own.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.engine.stop().await;
        info!("Orchestrator stopped");
    }

    /// Insert a task.
    pub async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError> {
        self.queue.enqueue(spec).await
    }

    /// Register a scheduled task.
    pub async fn schedule(&self, config: ScheduleConfig) -> Result<ScheduledTaskId, ScheduleError> {
        self.scheduler.schedule(config).await
    }

    /// Create and run a chain to completion.
    pub async fn run_chain(&self, config: ChainConfig) -> Result<(ChainId, Vec<ChainStepResult>), ChainError> {
        let id = self.chains.create_chain(config).await?;
        let results = self.chains.start_chain(id).await?;
        Ok((id, results))
    }

    /// Hand a finished execution to the reactive bridge.
    pub async fn react(&self, execution: &Execution) -> Vec<Reaction> {
        self.bridge.react(execution).await
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Configuration in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Task queue.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Dispatch loop.
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Scheduler.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Chain executor.
    pub fn chains(&self) -> &ChainExecutor {
        &self.chains
    }

    /// Reactive bridge.
    pub fn bridge(&self) -> &ReactiveBridge {
        &self.bridge
    }
}
