//! Work commands: the deferred side effects a state machine transition emits.
//!
//! A transition never applies its side effects directly. It appends one or
//! more [`WorkCommand`]s to the enclosing transaction's [`WorkQueue`], which
//! is drained only once the transaction's mutations have committed.

use chrono::{DateTime, Utc};

use super::task::{ScheduledTask, ScheduleStatus};

/// An owned mutation applied to a task record before it is persisted.
///
/// Boxed as `FnOnce` because each mutation closes over the specific fields a
/// transition wants to set (e.g. `ASSIGNED` fills in placement info) and is
/// applied exactly once.
pub type TaskMutation = Box<dyn FnOnce(&mut ScheduledTask) + Send>;

/// A deferred side effect emitted by a task state machine.
pub enum WorkCommand {
    /// Ask the driver to kill the task.
    Kill { task_id: String },
    /// Schedule a plain reschedule (no update in progress).
    Reschedule { task_id: String },
    /// Reschedule using the update's `new_config` for this shard.
    Update { task_id: String },
    /// Reschedule using the update's `old_config` for this shard.
    Rollback { task_id: String },
    /// Persist a status transition, appending a task event and optionally
    /// applying a field mutation (e.g. placement info on ASSIGN). `timestamp`
    /// is stamped by the state machine's injected clock at the moment the
    /// transition was accepted, so tests can assert exact event times via a
    /// `FakeClock` instead of whatever clock the draining transaction uses.
    UpdateState {
        task_id: String,
        new_status: ScheduleStatus,
        audit_message: Option<String>,
        mutation: Option<TaskMutation>,
        timestamp: DateTime<Utc>,
    },
    /// Remove the task record entirely.
    Delete { task_id: String },
    /// Bump the task's failure count.
    IncrementFailures { task_id: String },
}

impl WorkCommand {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Kill { task_id }
            | Self::Reschedule { task_id }
            | Self::Update { task_id }
            | Self::Rollback { task_id }
            | Self::UpdateState { task_id, .. }
            | Self::Delete { task_id }
            | Self::IncrementFailures { task_id } => task_id,
        }
    }

    fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Kill { .. } => "KILL",
            Self::Reschedule { .. } => "RESCHEDULE",
            Self::Update { .. } => "UPDATE",
            Self::Rollback { .. } => "ROLLBACK",
            Self::UpdateState { .. } => "UPDATE_STATE",
            Self::Delete { .. } => "DELETE",
            Self::IncrementFailures { .. } => "INCREMENT_FAILURES",
        }
    }
}

impl std::fmt::Debug for WorkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCommand")
            .field("kind", &self.kind())
            .field("task_id", &self.task_id())
            .finish()
    }
}

/// Transaction-scoped queue of deferred work.
///
/// Ordering guarantee: every `DELETE` entry drains strictly after every
/// non-`DELETE` entry (a transition may mutate a task and then delete it;
/// the mutation must land first). Order within either class is
/// unspecified — callers must not depend on it.
#[derive(Default)]
pub struct WorkQueue {
    items: Vec<WorkCommand>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: WorkCommand) {
        self.items.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Drain the queue, non-`DELETE` items first. The queue is empty after
    /// this call returns.
    pub fn drain_ordered(&mut self) -> Vec<WorkCommand> {
        let items = std::mem::take(&mut self.items);
        let (mut non_delete, delete): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|item| !item.is_delete());
        non_delete.extend(delete);
        non_delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn delete_entries_always_drain_after_non_delete() {
        let mut queue = WorkQueue::new();
        queue.push(WorkCommand::Delete { task_id: "a".into() });
        queue.push(WorkCommand::Kill { task_id: "b".into() });
        queue.push(WorkCommand::Delete { task_id: "c".into() });
        queue.push(WorkCommand::Reschedule { task_id: "d".into() });

        let drained = queue.drain_ordered();
        let kinds: Vec<&'static str> = drained.iter().map(WorkCommand::kind).collect();
        let first_delete = kinds.iter().position(|k| *k == "DELETE").unwrap();
        assert!(kinds[..first_delete].iter().all(|k| *k != "DELETE"));
        assert_eq!(kinds[first_delete..].iter().filter(|k| **k != "DELETE").count(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut queue = WorkQueue::new();
        queue.push(WorkCommand::Kill { task_id: "a".into() });
        assert_eq!(queue.len(), 1);
        let _ = queue.drain_ordered();
        assert_eq!(queue.len(), 0);
    }
}
