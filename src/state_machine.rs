//! The per-task status state machine.
//!
//! A machine is reconstructed from the store on every transaction that
//! touches a task and never persisted itself — only the [`WorkCommand`]s it
//! emits into the caller-owned [`WorkQueue`] carry any lasting effect.

use crate::clock::Clock;
use crate::model::{ScheduleStatus, ScheduledTask, TaskMutation, WorkCommand, WorkQueue};

/// Drives one task's status forward. `update_check` lets the state manager
/// tell the machine whether the task's (role, job) currently has a
/// registered update in progress, without the machine reaching into the
/// update store itself.
pub struct TaskStateMachine<'a> {
    task_id: String,
    task: Option<ScheduledTask>,
    update_check: Box<dyn Fn() -> bool + Send + Sync + 'a>,
    clock: &'a dyn Clock,
    work_queue: &'a mut WorkQueue,
    status: ScheduleStatus,
}

impl<'a> TaskStateMachine<'a> {
    pub fn new(
        task_id: impl Into<String>,
        task: Option<ScheduledTask>,
        update_check: impl Fn() -> bool + Send + Sync + 'a,
        clock: &'a dyn Clock,
        work_queue: &'a mut WorkQueue,
        initial_state: ScheduleStatus,
    ) -> Self {
        Self { task_id: task_id.into(), task, update_check: Box::new(update_check), clock, work_queue, status: initial_state }
    }

    pub fn status(&self) -> ScheduleStatus {
        self.status
    }

    pub fn task(&self) -> Option<&ScheduledTask> {
        self.task.as_ref()
    }

    /// Drive the machine to `target`. Returns whether the transition (or
    /// audit-only no-op) was accepted.
    pub fn update_state(
        &mut self,
        target: ScheduleStatus,
        audit_message: Option<String>,
        mutation: Option<TaskMutation>,
    ) -> bool {
        if self.task.is_none() {
            // A status message for a task the store doesn't know. Ask the
            // framework to stop reporting it; no persistent state is touched.
            self.work_queue.push(WorkCommand::Kill { task_id: self.task_id.clone() });
            self.status = ScheduleStatus::Unknown;
            return false;
        }

        let current = self.status;

        if target == current {
            return match audit_message {
                Some(message) => {
                    self.emit_update_state(target, Some(message), None);
                    true
                }
                None => false,
            };
        }

        if !is_legal_transition(current, target) {
            tracing::warn!(task_id = %self.task_id, from = %current, to = %target, "illegal state transition");
            return false;
        }

        self.emit_update_state(target, audit_message, mutation);
        self.status = target;

        match target {
            ScheduleStatus::Killing | ScheduleStatus::Updating | ScheduleStatus::Rollback => {
                self.work_queue.push(WorkCommand::Kill { task_id: self.task_id.clone() });
            }
            ScheduleStatus::Failed => {
                self.work_queue.push(WorkCommand::IncrementFailures { task_id: self.task_id.clone() });
                self.emit_post_terminal_work(current, target);
            }
            ScheduleStatus::Finished | ScheduleStatus::Killed | ScheduleStatus::Lost => {
                self.emit_post_terminal_work(current, target);
            }
            _ => {}
        }

        true
    }

    /// Mark a terminal task for garbage collection. Only legal once the task
    /// has actually reached a terminal status.
    pub fn expire(&mut self) -> bool {
        if self.status.is_terminal() {
            self.work_queue.push(WorkCommand::Delete { task_id: self.task_id.clone() });
            true
        } else {
            false
        }
    }

    fn emit_update_state(&mut self, target: ScheduleStatus, audit_message: Option<String>, mutation: Option<TaskMutation>) {
        self.work_queue.push(WorkCommand::UpdateState {
            task_id: self.task_id.clone(),
            new_status: target,
            audit_message,
            mutation,
            timestamp: self.clock.now(),
        });
    }

    /// Decide whether a terminal transition should trigger a replacement
    /// task, and via which path (plain reschedule, or update/rollback
    /// continuation if the task was mid-update when it terminated).
    fn emit_post_terminal_work(&mut self, previous: ScheduleStatus, terminal: ScheduleStatus) {
        if previous == ScheduleStatus::Updating && (self.update_check)() {
            self.work_queue.push(WorkCommand::Update { task_id: self.task_id.clone() });
            return;
        }
        if previous == ScheduleStatus::Rollback && (self.update_check)() {
            self.work_queue.push(WorkCommand::Rollback { task_id: self.task_id.clone() });
            return;
        }
        if self.should_reschedule(terminal) {
            self.work_queue.push(WorkCommand::Reschedule { task_id: self.task_id.clone() });
        }
    }

    fn should_reschedule(&self, terminal: ScheduleStatus) -> bool {
        let Some(task) = &self.task else { return false };
        match terminal {
            ScheduleStatus::Lost => true,
            ScheduleStatus::Failed => task.config.is_service || task.failure_count < task.config.max_task_failures,
            ScheduleStatus::Killed | ScheduleStatus::Finished => task.config.is_service,
            _ => false,
        }
    }
}

fn is_legal_transition(from: ScheduleStatus, to: ScheduleStatus) -> bool {
    use ScheduleStatus::*;
    match (from, to) {
        (Init, Pending) => true,
        (Pending, Assigned) => true,
        (Assigned, Starting) => true,
        (Starting, Running) => true,
        (Killing, Killed) | (Killing, Lost) => true,
        (f, Updating) | (f, Rollback) if f.is_active() && !matches!(f, Updating | Rollback) => true,
        (f, Killing) if !f.is_terminal() && f != Killing => true,
        (f, Failed) | (f, Finished) | (f, Killed) | (f, Lost)
            if matches!(f, Assigned | Starting | Running | Updating | Rollback | Killing | Preempting | Restarting) =>
        {
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::model::{AssignedPlacement, TaskConfig};
    use pretty_assertions::assert_eq;

    fn config(is_service: bool, max_task_failures: i32) -> TaskConfig {
        TaskConfig {
            role: "r".into(),
            environment: "prod".into(),
            job_name: "j".into(),
            shard_id: 0,
            requested_ports: vec!["http".into()],
            num_cpus: 1.0,
            ram_mb: 512,
            disk_mb: 1024,
            is_service,
            max_task_failures,
            constraints: vec![],
        }
    }

    fn task(status: ScheduleStatus, is_service: bool, failure_count: i32) -> ScheduledTask {
        ScheduledTask {
            task_id: "t1".into(),
            status,
            config: config(is_service, 1),
            placement: AssignedPlacement::default(),
            failure_count,
            ancestor_id: None,
            task_events: vec![],
            created_at: chrono::DateTime::from_timestamp_millis(0).unwrap(),
        }
    }

    #[test]
    fn init_to_pending_emits_update_state() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut machine =
            TaskStateMachine::new("t1", Some(task(ScheduleStatus::Init, false, 0)), || false, &clock, &mut queue, ScheduleStatus::Init);
        assert!(machine.update_state(ScheduleStatus::Pending, None, None));
        assert_eq!(machine.status(), ScheduleStatus::Pending);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut machine = TaskStateMachine::new(
            "t1",
            Some(task(ScheduleStatus::Finished, false, 0)),
            || false,
            &clock,
            &mut queue,
            ScheduleStatus::Finished,
        );
        assert!(!machine.update_state(ScheduleStatus::Running, None, None));
        assert!(queue.is_empty());
    }

    #[test]
    fn same_state_with_audit_message_appends_event_only() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut machine = TaskStateMachine::new(
            "t1",
            Some(task(ScheduleStatus::Running, false, 0)),
            || false,
            &clock,
            &mut queue,
            ScheduleStatus::Running,
        );
        assert!(machine.update_state(ScheduleStatus::Running, Some("health check".into()), None));
        assert_eq!(queue.len(), 1);
        assert!(!machine.update_state(ScheduleStatus::Running, None, None));
    }

    #[test]
    fn failed_non_service_under_failure_limit_reschedules() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut machine = TaskStateMachine::new(
            "t1",
            Some(task(ScheduleStatus::Running, false, 0)),
            || false,
            &clock,
            &mut queue,
            ScheduleStatus::Running,
        );
        machine.update_state(ScheduleStatus::Failed, None, None);
        let drained = queue.drain_ordered();
        assert!(drained.iter().any(|c| matches!(c, WorkCommand::IncrementFailures { .. })));
        assert!(drained.iter().any(|c| matches!(c, WorkCommand::Reschedule { .. })));
    }

    #[test]
    fn killed_non_service_task_does_not_reschedule() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut machine = TaskStateMachine::new(
            "t1",
            Some(task(ScheduleStatus::Killing, false, 0)),
            || false,
            &clock,
            &mut queue,
            ScheduleStatus::Killing,
        );
        machine.update_state(ScheduleStatus::Killed, None, None);
        let drained = queue.drain_ordered();
        assert!(!drained.iter().any(|c| matches!(c, WorkCommand::Reschedule { .. })));
    }

    #[test]
    fn terminal_transition_from_updating_emits_update_work() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut machine = TaskStateMachine::new(
            "t1",
            Some(task(ScheduleStatus::Updating, false, 0)),
            || true,
            &clock,
            &mut queue,
            ScheduleStatus::Updating,
        );
        assert!(machine.update_state(ScheduleStatus::Killed, None, None));
        let drained = queue.drain_ordered();
        assert!(drained.iter().any(|c| matches!(c, WorkCommand::Update { .. })));
    }

    #[test]
    fn unknown_task_only_emits_kill() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut machine = TaskStateMachine::new("t1", None, || false, &clock, &mut queue, ScheduleStatus::Unknown);
        assert!(!machine.update_state(ScheduleStatus::Pending, None, None));
        let drained = queue.drain_ordered();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], WorkCommand::Kill { .. }));
    }

    #[test]
    fn expire_requires_terminal_status() {
        let clock = FakeClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap());
        let mut queue = WorkQueue::default();
        let mut active = TaskStateMachine::new(
            "t1",
            Some(task(ScheduleStatus::Running, false, 0)),
            || false,
            &clock,
            &mut queue,
            ScheduleStatus::Running,
        );
        assert!(!active.expire());

        let mut queue2 = WorkQueue::default();
        let mut finished = TaskStateMachine::new(
            "t1",
            Some(task(ScheduleStatus::Finished, false, 0)),
            || false,
            &clock,
            &mut queue2,
            ScheduleStatus::Finished,
        );
        assert!(finished.expire());
        assert_eq!(queue2.len(), 1);
    }

}
