//! The reactive bridge - turns execution outcomes into queue tasks.

use conductor_core::{EventKind, Execution, ExecutionSession, ReactionId};
use conductor_execution::{EventBus, TaskQueue};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::ReactionAction;
use crate::builtin::default_rules;
use crate::rule::{Reaction, ReactionRule};

/// Errors raised by rule management.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// A rule with this name is already registered
    #[error("reaction rule '{0}' already registered")]
    DuplicateRule(String),
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, ReactiveError>;

/// Observes finished code executions and synthesizes follow-up tasks.
#[derive(Clone)]
pub struct ReactiveBridge {
    queue: TaskQueue,
    events: EventBus,
    rules: Arc<RwLock<Vec<ReactionRule>>>,
    reactions: Arc<Mutex<Vec<Reaction>>>,
}

impl ReactiveBridge {
    /// Create a bridge with the built-in rule set.
    pub fn new(queue: TaskQueue, events: EventBus) -> Self {
        Self::with_rules(queue, events, default_rules())
    }

    /// Create a bridge with exactly `rules`.
    pub fn with_rules(queue: TaskQueue, events: EventBus, rules: Vec<ReactionRule>) -> Self {
        Self {
            queue,
            events,
            rules: Arc::new(RwLock::new(rules)),
            reactions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append a rule. Names must be unique.
    pub async fn add_reaction_rule(&self, rule: ReactionRule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.name() == rule.name()) {
            return Err(ReactiveError::DuplicateRule(rule.name().to_string()));
        }
        info!("Added reaction rule '{}'", rule.name());
        rules.push(rule);
        Ok(())
    }

    /// Remove a rule by name. Returns whether it existed.
    pub async fn remove_reaction_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name() != name);
        before != rules.len()
    }

    /// Registered rule names, in evaluation order.
    pub async fn rule_names(&self) -> Vec<String> {
        self.rules.read().await.iter().map(|r| r.name().to_string()).collect()
    }

    /// Evaluate every rule against a finished execution and dispatch the hits.
    ///
    /// Unfinished executions are ignored.
    pub async fn react(&self, execution: &Execution) -> Vec<Reaction> {
        if !execution.status.is_finished() {
            debug!("Ignoring unfinished execution {}", execution.id);
            return Vec::new();
        }

        let hits: Vec<(String, ReactionAction)> = {
            let rules = self.rules.read().await;
            rules
                .iter()
                .filter_map(|rule| rule.evaluate(execution).map(|a| (rule.name().to_string(), a)))
                .collect()
        };

        let mut triggered = Vec::with_capacity(hits.len());
        for (rule, action) in hits {
            triggered.push(self.dispatch(execution, rule, action).await);
        }

        if !triggered.is_empty() {
            self.reactions.lock().await.extend(triggered.iter().cloned());
        }
        triggered
    }

    /// React to every finished execution of a session, in order.
    pub async fn react_session(&self, session: &ExecutionSession) -> Vec<Reaction> {
        let mut all = Vec::new();
        for execution in session.finished() {
            all.extend(self.react(execution).await);
        }
        all
    }

    /// Consume executions from the code-execution collaborator until the
    /// sender side closes.
    pub fn attach(&self, mut receiver: mpsc::Receiver<Execution>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(execution) = receiver.recv().await {
                bridge.react(&execution).await;
            }
            debug!("Execution feed closed");
        })
    }

    /// Every reaction so far, oldest first.
    pub async fn reactions(&self) -> Vec<Reaction> {
        self.reactions.lock().await.clone()
    }

    async fn dispatch(&self, execution: &Execution, rule: String, action: ReactionAction) -> Reaction {
        let spec = action.to_task(execution);
        let (task_id, error) = match self.queue.enqueue(spec).await {
            Ok(id) => (Some(id), None),
            Err(e) => {
                warn!("Reaction '{}' could not enqueue its task: {}", rule, e);
                (None, Some(e.to_string()))
            }
        };

        let reaction = Reaction {
            id: ReactionId::new(),
            rule,
            execution_id: execution.id,
            action,
            task_id,
            error,
            timestamp: chrono::Utc::now(),
        };
        info!(
            "Reaction '{}' -> {} for execution {}",
            reaction.rule,
            reaction.action.name(),
            execution.id
        );
        self.events.emit(EventKind::ReactionTriggered {
            reaction_id: reaction.id,
            rule: reaction.rule.clone(),
            execution_id: execution.id,
            action: reaction.action.name().to_string(),
            task_id,
        });
        reaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{TaskSpec, TaskType};

    fn setup() -> (ReactiveBridge, TaskQueue, EventBus) {
        let events = EventBus::default();
        let queue = TaskQueue::new(events.clone());
        (ReactiveBridge::new(queue.clone(), events.clone()), queue, events)
    }

    #[tokio::test]
    async fn test_missing_module_synthesizes_one_install_task() {
        let (bridge, queue, events) = setup();
        let execution = Execution::new("import numpy", "python")
            .failed("ModuleNotFoundError: No module named 'numpy'");

        let reactions = bridge.react(&execution).await;
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].rule, "missing_module");

        let pending = queue.state().await.pending;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, TaskType::CodeExecution);
        assert_eq!(pending[0].input["module"], "numpy");
        assert_eq!(Some(pending[0].id), reactions[0].task_id);

        assert!(events.history_names().contains(&"reaction:triggered"));
    }

    #[tokio::test]
    async fn test_unfinished_execution_is_ignored() {
        let (bridge, queue, _) = setup();
        let running = Execution::new("import numpy", "python");
        assert!(bridge.react(&running).await.is_empty());
        assert!(queue.state().await.is_empty());
    }

    #[tokio::test]
    async fn test_custom_rules_run_after_builtins() {
        let (bridge, queue, _) = setup();
        bridge
            .add_reaction_rule(ReactionRule::new("audit_failures", |e: &Execution| {
                e.error.as_ref().map(|_| ReactionAction::Enqueue {
                    task: TaskSpec::new(TaskType::Monitoring, "record failure"),
                })
            }))
            .await
            .unwrap();

        let duplicate = bridge
            .add_reaction_rule(ReactionRule::new("audit_failures", |_: &Execution| None))
            .await;
        assert!(matches!(duplicate, Err(ReactiveError::DuplicateRule(_))));

        let execution = Execution::new("1/0", "python").failed("ZeroDivisionError: division by zero");
        let reactions = bridge.react(&execution).await;
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].action.name(), "enqueue");
        assert_eq!(queue.state().await.pending[0].description, "record failure");

        assert!(bridge.remove_reaction_rule("audit_failures").await);
        assert!(!bridge.remove_reaction_rule("audit_failures").await);
        assert!(bridge.react(&execution).await.is_empty());
    }

    #[tokio::test]
    async fn test_session_reacts_to_finished_only() {
        let (bridge, _, _) = setup();
        let mut session = ExecutionSession::new();
        session.push(Execution::new("x", "python").failed("SyntaxError: invalid syntax"));
        session.push(Execution::new("y", "python"));
        session.push(Execution::new("z", "python").succeeded("{\"ok\": true}"));

        let reactions = bridge.react_session(&session).await;
        let actions: Vec<_> = reactions.iter().map(|r| r.action.name()).collect();
        assert_eq!(actions, vec!["auto_fix_syntax", "process_data"]);
        assert_eq!(bridge.reactions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_attach_consumes_feed() {
        let (bridge, queue, _) = setup();
        let (tx, rx) = mpsc::channel(8);
        let listener = bridge.attach(rx);

        tx.send(Execution::new("require('left-pad')", "javascript")
            .failed("Error: Cannot find module 'left-pad'"))
            .await
            .unwrap();
        drop(tx);
        listener.await.unwrap();

        let pending = queue.state().await.pending;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].input["command"], "npm install left-pad");
    }
}
