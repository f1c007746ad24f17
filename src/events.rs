//! Pub/sub events emitted after a write transaction commits.
//!
//! Events are buffered during the transaction and published only once the
//! commit succeeds, so subscribers never observe a state change that was
//! later rolled back.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::{ScheduleStatus, ScheduledTask};

/// A fact about a committed change, published after commit.
#[derive(Debug, Clone)]
pub enum Event {
    TaskStateChange { task_id: String, old_status: Option<ScheduleStatus>, new_status: ScheduleStatus },
    TasksDeleted { task_ids: Vec<String> },
    /// A snapshot re-publish, e.g. after `fetchTasks` is used to seed a
    /// consumer's view. Not spec-mandated, but useful for a debug CLI and
    /// grounded on the teacher's `SessionEvent::Snapshot` pattern.
    Snapshot { tasks: Vec<ScheduledTask> },
}

/// Where committed events go. Implementations must not block the caller for
/// long — `StateManager` awaits `publish` once per event, in order, after
/// every successful commit.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event);
}

/// An `EventSink` that forwards onto an unbounded mpsc channel.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: Event) {
        // A closed receiver means nobody is listening; dropping the event is
        // the correct behavior, not an error.
        let _ = self.sender.send(event);
    }
}

/// An `EventSink` that only logs. Useful as a default when the caller has no
/// subscriber wired up yet.
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn publish(&self, event: Event) {
        match event {
            Event::TaskStateChange { task_id, old_status, new_status } => {
                tracing::info!(task_id, ?old_status, %new_status, "task state change");
            }
            Event::TasksDeleted { task_ids } => {
                tracing::info!(count = task_ids.len(), "tasks deleted");
            }
            Event::Snapshot { tasks } => {
                tracing::debug!(count = tasks.len(), "snapshot published");
            }
        }
    }
}
