//! Task session registry
//!
//! Mirrors the lifecycle of every task the engine is running so that
//! command handlers can validate task-scoped commands without calling
//! into the engine. Lifecycle transitions originate from engine
//! callbacks only; the registry records, it never drives.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

/// Lifecycle state of a task session.
///
/// Created -> Started -> (Paused <-> Started) -> Completed | Aborted.
/// Aborted may also follow Created or Paused directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Started,
    Paused,
    Completed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Aborted)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// The engine is authoritative, so an out-of-order callback is
    /// logged rather than rejected, but this is what a well-behaved
    /// sequence looks like.
    pub fn can_transition(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Started)
                | (Created, Aborted)
                | (Started, Paused)
                | (Started, Completed)
                | (Started, Aborted)
                | (Paused, Started)
                | (Paused, Aborted)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Created => "created",
            TaskState::Started => "started",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// A live task session.
#[derive(Debug, Clone)]
pub struct TaskSession {
    pub state: TaskState,
    /// Parent that spawned this task, if any. Informational only.
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registry of live task sessions, keyed by task id.
///
/// Terminal transitions remove the session; a second terminal callback
/// for the same id is a no-op, so duplicate completion or abort
/// notifications from the engine are harmless.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, TaskSession>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Record a newly created task.
    pub fn insert(&self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        let session = TaskSession {
            state: TaskState::Created,
            parent_id: None,
            created_at: Utc::now(),
        };
        if self.tasks.insert(task_id.clone(), session).is_some() {
            warn!("Task {} created twice, resetting session", task_id);
        } else {
            debug!("Task session created: {}", task_id);
        }
    }

    /// Apply a lifecycle transition reported by the engine.
    ///
    /// Terminal states remove the session. Returns the previous state,
    /// or None when the task was unknown (including the duplicate
    /// terminal case).
    pub fn transition(&self, task_id: &str, next: TaskState) -> Option<TaskState> {
        let Some(mut session) = self.tasks.get_mut(task_id) else {
            if next.is_terminal() {
                debug!("Duplicate terminal transition for {} ignored", task_id);
            } else {
                warn!("Transition to {} for unknown task {}", next, task_id);
            }
            return None;
        };

        let previous = session.state;
        if !previous.can_transition(next) {
            warn!(
                "Out-of-order transition for {}: {} -> {}",
                task_id, previous, next
            );
        }
        session.state = next;
        drop(session);

        if next.is_terminal() {
            self.tasks.remove(task_id);
            debug!("Task session closed: {} ({})", task_id, next);
        }
        Some(previous)
    }

    /// Record a parent/child spawn relationship.
    pub fn link(&self, parent_id: &str, child_id: &str) {
        match self.tasks.get_mut(child_id) {
            Some(mut child) => {
                child.parent_id = Some(parent_id.to_string());
                debug!("Task {} linked to parent {}", child_id, parent_id);
            }
            None => debug!(
                "Spawn link for unknown child {} (parent {})",
                child_id, parent_id
            ),
        }
    }

    pub fn lookup(&self, task_id: &str) -> Option<TaskSession> {
        self.tasks.get(task_id).map(|session| session.clone())
    }

    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|session| session.state)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_count", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle() {
        let registry = TaskRegistry::new();
        registry.insert("t1");
        assert_eq!(registry.state("t1"), Some(TaskState::Created));

        assert_eq!(
            registry.transition("t1", TaskState::Started),
            Some(TaskState::Created)
        );
        assert_eq!(registry.state("t1"), Some(TaskState::Started));

        assert_eq!(
            registry.transition("t1", TaskState::Completed),
            Some(TaskState::Started)
        );
        assert!(!registry.contains("t1"));
    }

    #[test]
    fn test_pause_resume() {
        let registry = TaskRegistry::new();
        registry.insert("t1");
        registry.transition("t1", TaskState::Started);
        registry.transition("t1", TaskState::Paused);
        assert_eq!(registry.state("t1"), Some(TaskState::Paused));
        registry.transition("t1", TaskState::Started);
        assert_eq!(registry.state("t1"), Some(TaskState::Started));
    }

    #[test]
    fn test_duplicate_terminal_is_noop() {
        let registry = TaskRegistry::new();
        registry.insert("t1");
        registry.transition("t1", TaskState::Started);
        registry.transition("t1", TaskState::Aborted);
        assert!(!registry.contains("t1"));

        // Second abort for an already-removed task changes nothing.
        assert_eq!(registry.transition("t1", TaskState::Aborted), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_abort_from_created() {
        let registry = TaskRegistry::new();
        registry.insert("t1");
        assert_eq!(
            registry.transition("t1", TaskState::Aborted),
            Some(TaskState::Created)
        );
        assert!(!registry.contains("t1"));
    }

    #[test]
    fn test_transition_unknown_task() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.transition("ghost", TaskState::Started), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_link_sets_parent() {
        let registry = TaskRegistry::new();
        registry.insert("parent");
        registry.insert("child");
        registry.link("parent", "child");

        let child = registry.lookup("child").unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("parent"));
        // Parent termination does not cascade to the child.
        registry.transition("parent", TaskState::Aborted);
        assert!(registry.contains("child"));
    }

    #[test]
    fn test_link_unknown_child() {
        let registry = TaskRegistry::new();
        registry.insert("parent");
        registry.link("parent", "ghost");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_can_transition_table() {
        use TaskState::*;
        assert!(Created.can_transition(Started));
        assert!(Started.can_transition(Paused));
        assert!(Paused.can_transition(Started));
        assert!(Paused.can_transition(Aborted));
        assert!(!Created.can_transition(Completed));
        assert!(!Completed.can_transition(Started));
        assert!(!Paused.can_transition(Completed));
    }

    #[test]
    fn test_task_ids_snapshot() {
        let registry = TaskRegistry::new();
        registry.insert("a");
        registry.insert("b");
        let mut ids = registry.task_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
