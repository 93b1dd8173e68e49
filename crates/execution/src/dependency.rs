//! Dependency resolution for queued tasks.

use conductor_core::{Task, TaskId};
use std::collections::{HashMap, HashSet};

/// Result of dependency resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// All dependencies terminal, ready to execute
    Ready,
    /// Blocked by these tasks (non-terminal or not enqueued yet)
    Blocked(Vec<TaskId>),
}

/// Resolves task dependencies against the queue's task map.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Check if a task's dependencies are satisfied.
    ///
    /// A dependency counts as satisfied once it is terminal, whether it
    /// completed or failed.
    pub fn check(&self, tasks: &HashMap<TaskId, Task>, task: &Task) -> Resolution {
        let blocked: Vec<_> = task
            .depends_on
            .iter()
            .filter(|dep| !tasks.get(*dep).map_or(false, Task::is_terminal))
            .copied()
            .collect();

        if blocked.is_empty() {
            Resolution::Ready
        } else {
            Resolution::Blocked(blocked)
        }
    }

    /// Find a dependency cycle that `candidate` would close if inserted.
    ///
    /// Returns the cycle as a path starting and ending at `candidate.id`.
    pub fn find_cycle(&self, tasks: &HashMap<TaskId, Task>, candidate: &Task) -> Option<Vec<TaskId>> {
        let mut visited = HashSet::new();

        for dep in &candidate.depends_on {
            let mut path = vec![candidate.id];
            if self.reaches(tasks, candidate.id, *dep, &mut path, &mut visited) {
                return Some(path);
            }
        }

        None
    }

    /// Depth-first walk along `depends_on` edges looking for `target`.
    fn reaches(
        &self,
        tasks: &HashMap<TaskId, Task>,
        target: TaskId,
        current: TaskId,
        path: &mut Vec<TaskId>,
        visited: &mut HashSet<TaskId>,
    ) -> bool {
        path.push(current);
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            path.pop();
            return false;
        }

        if let Some(task) = tasks.get(&current) {
            for dep in &task.depends_on {
                if self.reaches(tasks, target, *dep, path, visited) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{Payload, TaskSpec, TaskType};

    fn task(id: TaskId, deps: &[TaskId]) -> Task {
        let mut spec = TaskSpec::new(TaskType::Custom, "t").with_id(id);
        for dep in deps {
            spec = spec.depends_on(*dep);
        }
        Task::from_spec(spec)
    }

    fn map(tasks: Vec<Task>) -> HashMap<TaskId, Task> {
        tasks.into_iter().map(|t| (t.id, t)).collect()
    }

    #[test]
    fn test_no_dependencies_is_ready() {
        let resolver = DependencyResolver::new();
        let t = task(TaskId::new(), &[]);
        assert_eq!(resolver.check(&HashMap::new(), &t), Resolution::Ready);
    }

    #[test]
    fn test_blocked_until_dependency_terminal() {
        let resolver = DependencyResolver::new();
        let b = TaskId::new();
        let a = task(TaskId::new(), &[b]);

        let mut tasks = map(vec![task(b, &[])]);
        assert_eq!(resolver.check(&tasks, &a), Resolution::Blocked(vec![b]));

        let dep = tasks.get_mut(&b).unwrap();
        dep.start().unwrap();
        assert_eq!(resolver.check(&tasks, &a), Resolution::Blocked(vec![b]));

        tasks.get_mut(&b).unwrap().fail("boom").unwrap();
        assert_eq!(resolver.check(&tasks, &a), Resolution::Ready);
    }

    #[test]
    fn test_unknown_dependency_blocks() {
        let resolver = DependencyResolver::new();
        let ghost = TaskId::new();
        let a = task(TaskId::new(), &[ghost]);
        assert_eq!(resolver.check(&HashMap::new(), &a), Resolution::Blocked(vec![ghost]));
    }

    #[test]
    fn test_completed_dependency_is_ready() {
        let resolver = DependencyResolver::new();
        let mut b = task(TaskId::new(), &[]);
        b.start().unwrap();
        b.complete(Payload::new()).unwrap();
        let a = task(TaskId::new(), &[b.id]);
        assert_eq!(resolver.check(&map(vec![b]), &a), Resolution::Ready);
    }

    #[test]
    fn test_find_cycle_through_forward_reference() {
        let resolver = DependencyResolver::new();
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());

        // a -> b -> c with c not enqueued yet; c -> a closes the loop
        let tasks = map(vec![task(a, &[b]), task(b, &[c])]);
        let cycle = resolver.find_cycle(&tasks, &task(c, &[a])).unwrap();
        assert_eq!(cycle, vec![c, a, b, c]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let resolver = DependencyResolver::new();
        let a = TaskId::new();
        assert_eq!(
            resolver.find_cycle(&HashMap::new(), &task(a, &[a])),
            Some(vec![a, a])
        );
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let resolver = DependencyResolver::new();
        let (root, left, right) = (TaskId::new(), TaskId::new(), TaskId::new());
        let tasks = map(vec![
            task(root, &[]),
            task(left, &[root]),
            task(right, &[root]),
        ]);
        assert!(resolver.find_cycle(&tasks, &task(TaskId::new(), &[left, right])).is_none());
    }
}
