//! Task selection strategies.

use conductor_core::{TaskId, TaskPriority};

/// A ready task as seen by a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Task id
    pub id: TaskId,
    /// Task priority
    pub priority: TaskPriority,
    /// Insertion sequence number; lower was enqueued earlier
    pub seq: u64,
}

/// Strategy for selecting the next task to dispatch among ready tasks.
pub trait TaskSelector: Send + Sync {
    /// Pick one candidate, or none to leave everything pending.
    fn select(&self, ready: &[Candidate]) -> Option<TaskId>;
}

/// Highest priority first; ties broken by insertion order.
#[derive(Debug, Default, Clone)]
pub struct PrioritySelector {
    /// Minimum priority threshold
    min_priority: Option<TaskPriority>,
}

impl PrioritySelector {
    /// Create a new priority selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only dispatch tasks at or above `min_priority`.
    pub fn with_min_priority(mut self, min_priority: TaskPriority) -> Self {
        self.min_priority = Some(min_priority);
        self
    }
}

impl TaskSelector for PrioritySelector {
    fn select(&self, ready: &[Candidate]) -> Option<TaskId> {
        ready
            .iter()
            .filter(|c| self.min_priority.map_or(true, |min| c.priority >= min))
            .min_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.seq.cmp(&b.seq)))
            .map(|c| c.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(priority: TaskPriority, seq: u64) -> Candidate {
        Candidate {
            id: TaskId::new(),
            priority,
            seq,
        }
    }

    #[test]
    fn test_highest_priority_wins() {
        let ready = vec![
            candidate(TaskPriority::Low, 0),
            candidate(TaskPriority::Critical, 2),
            candidate(TaskPriority::High, 1),
        ];
        assert_eq!(PrioritySelector::new().select(&ready), Some(ready[1].id));
    }

    #[test]
    fn test_fifo_among_equal_priority() {
        let ready = vec![
            candidate(TaskPriority::High, 7),
            candidate(TaskPriority::High, 3),
            candidate(TaskPriority::High, 5),
        ];
        assert_eq!(PrioritySelector::new().select(&ready), Some(ready[1].id));
    }

    #[test]
    fn test_min_priority_filters() {
        let ready = vec![candidate(TaskPriority::Low, 0)];
        let selector = PrioritySelector::new().with_min_priority(TaskPriority::Medium);
        assert_eq!(selector.select(&ready), None);
        assert_eq!(PrioritySelector::new().select(&[]), None);
    }
}
