//! Process-local event bus.
//!
//! Subscribers receive events over a broadcast channel. A subscriber that
//! falls behind lags and loses old events; it never blocks the publisher or
//! other subscribers. The bus also keeps a bounded history for late readers.

use conductor_core::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Broadcast buffer per subscriber
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Events kept in the in-memory history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_history_limit() -> usize {
    512
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            history_limit: default_history_limit(),
        }
    }
}

/// Publish/subscribe hub shared by every orchestration component.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    history: Arc<Mutex<VecDeque<Event>>>,
    history_limit: usize,
}

impl EventBus {
    /// Create a bus with the given sizing.
    pub fn new(settings: &EventSettings) -> Self {
        let (sender, _) = broadcast::channel(settings.channel_capacity.max(1));
        Self {
            sender,
            history: Arc::new(Mutex::new(VecDeque::new())),
            history_limit: settings.history_limit,
        }
    }

    /// Publish an event. Never blocks; having no subscribers is fine.
    pub fn emit(&self, kind: EventKind) -> Event {
        let event = Event::new(kind);
        debug!(event = event.name(), "emit");

        if self.history_limit > 0 {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let _ = self.sender.send(event.clone());
        event
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    /// Names of retained events, oldest first.
    pub fn history_names(&self) -> Vec<&'static str> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().map(Event::name).collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ChainId, TaskId, TaskPriority, TaskType};

    fn added() -> EventKind {
        EventKind::TaskAdded {
            task_id: TaskId::new(),
            task_type: TaskType::Custom,
            priority: TaskPriority::Low,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(added());

        assert_eq!(a.recv().await.unwrap().name(), "task:added");
        assert_eq!(b.recv().await.unwrap().name(), "task:added");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new(&EventSettings {
            channel_capacity: 2,
            history_limit: 10,
        });
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for _ in 0..5 {
            bus.emit(added());
            fast.recv().await.unwrap();
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[test]
    fn test_emit_without_subscribers_and_bounded_history() {
        let bus = EventBus::new(&EventSettings {
            channel_capacity: 8,
            history_limit: 2,
        });

        bus.emit(added());
        bus.emit(EventKind::ChainCompleted {
            chain_id: ChainId::new(),
            steps_run: 1,
        });
        bus.emit(EventKind::ChainFailed {
            chain_id: ChainId::new(),
            steps_run: 1,
        });

        assert_eq!(bus.history_names(), vec!["chain:completed", "chain:failed"]);
    }
}
