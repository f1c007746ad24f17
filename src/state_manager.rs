//! Orchestration: opens write transactions, materializes task state
//! machines, drains the resulting work queue, and publishes buffered events
//! only once the commit actually lands.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rand::Rng;
use sqlx::{Sqlite, Transaction};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::driver::Driver;
use crate::error::{Result, SchedulerError};
use crate::events::{Event, EventSink};
use crate::ids::new_task_id;
use crate::model::{
    AssignedPlacement, ConfigSide, ScheduleStatus, ScheduledTask, TaskConfig, TaskMutation, TaskQuery, WorkCommand,
    WorkQueue,
};
use crate::state_machine::TaskStateMachine;
use crate::store::{task_store, update_store, Storage};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// State shared by every work item drained within one write transaction.
pub(crate) struct TxContext {
    pub(crate) tx: Transaction<'static, Sqlite>,
    pub(crate) queue: WorkQueue,
    pub(crate) events: Vec<Event>,
}

pub struct StateManager {
    storage: Storage,
    driver: Arc<dyn Driver>,
    event_sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl StateManager {
    pub fn new(storage: Storage, driver: Arc<dyn Driver>, event_sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self { storage, driver, event_sink, clock, config }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Within a write transaction, generate ids for `configs`, persist them
    /// as `INIT`, and drive each to `PENDING`.
    pub async fn insert_tasks(&self, configs: Vec<TaskConfig>) -> Result<BTreeSet<String>> {
        if !self.config.enable_job_creation {
            return Err(SchedulerError::schedule("job creation is disabled"));
        }
        self.run_write(move |ctx| Box::pin(async move { self.insert_tasks_tx(ctx, configs).await })).await
    }

    /// Drive the single `PENDING` task matching `task_id` to `ASSIGNED`,
    /// filling placement from `slave_id`/`slave_host` and mapping requested
    /// port names onto `available_ports` in order.
    pub async fn assign_task(
        &self,
        task_id: &str,
        slave_id: &str,
        slave_host: &str,
        available_ports: &BTreeSet<u32>,
    ) -> Result<ScheduledTask> {
        let task_id = task_id.to_string();
        let slave_id = slave_id.to_string();
        let slave_host = slave_host.to_string();
        let available_ports = available_ports.clone();
        self.run_write(move |ctx| {
            Box::pin(async move { self.assign_task_tx(ctx, &task_id, &slave_id, &slave_host, &available_ports).await })
        })
        .await
    }

    /// Drive every task matching `query` to `new_status`. Returns the count
    /// of machines that accepted the transition.
    pub async fn change_state(&self, query: TaskQuery, new_status: ScheduleStatus, audit_message: Option<String>) -> Result<usize> {
        self.run_write(move |ctx| Box::pin(async move { self.change_state_tx(ctx, &query, new_status, audit_message).await })).await
    }

    /// Read-only lookup; does not open a write transaction.
    pub async fn fetch_tasks(&self, query: &TaskQuery) -> Result<Vec<ScheduledTask>> {
        let mut conn = self.storage.acquire().await?;
        task_store::fetch_tasks(&mut conn, query).await
    }

    /// Drive every task matching `query` to `KILLING`, then block (outside
    /// any transaction) polling for none of them to remain active, under an
    /// exponential backoff bounded by the configured min/max.
    pub async fn kill_tasks(&self, query: TaskQuery, audit_message: Option<String>) -> Result<()> {
        let task_ids: BTreeSet<String> = {
            let mut conn = self.storage.acquire().await?;
            task_store::fetch_task_ids(&mut conn, &query).await?.into_iter().collect()
        };
        if task_ids.is_empty() {
            return Ok(());
        }
        let ids_query = TaskQuery { task_ids: Some(task_ids), ..Default::default() };
        self.change_state(ids_query.clone(), ScheduleStatus::Killing, audit_message).await?;
        self.wait_until_terminal(&ids_query).await
    }

    async fn wait_until_terminal(&self, query: &TaskQuery) -> Result<()> {
        let mut backoff = self.config.kill_task_initial_backoff;
        loop {
            let active_query = TaskQuery { statuses: Some(ScheduleStatus::active_variants()), ..query.clone() };
            let remaining = self.fetch_tasks(&active_query).await?;
            if remaining.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(jittered(backoff)).await;
            backoff = std::cmp::min(backoff * 2, self.config.kill_task_max_backoff);
        }
    }

    pub(crate) async fn run_write<F, R>(&self, body: F) -> Result<R>
    where
        F: for<'c> FnOnce(&'c mut TxContext) -> BoxFuture<'c, Result<R>>,
    {
        let tx = self.storage.begin().await?;
        let mut ctx = TxContext { tx, queue: WorkQueue::new(), events: Vec::new() };

        let value = match body(&mut ctx).await {
            Ok(value) => value,
            Err(error) => {
                let _ = ctx.tx.rollback().await;
                return Err(error);
            }
        };

        let mut post_commit_kills = Vec::new();
        while !ctx.queue.is_empty() {
            for command in ctx.queue.drain_ordered() {
                if let Err(error) = self.apply_command(&mut ctx, &mut post_commit_kills, command).await {
                    let _ = ctx.tx.rollback().await;
                    return Err(error);
                }
            }
        }

        ctx.tx.commit().await?;

        for task_id in post_commit_kills {
            if let Err(error) = self.driver.kill_task(&task_id).await {
                tracing::warn!(task_id, %error, "driver kill_task failed");
            }
        }
        for event in ctx.events {
            self.event_sink.publish(event).await;
        }

        Ok(value)
    }

    pub(crate) async fn insert_tasks_tx(&self, ctx: &mut TxContext, configs: Vec<TaskConfig>) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for config in configs {
            let task_id = new_task_id(&config.role, &config.job_name, config.shard_id);
            let task = ScheduledTask {
                task_id: task_id.clone(),
                status: ScheduleStatus::Init,
                config,
                placement: AssignedPlacement::default(),
                failure_count: 0,
                ancestor_id: None,
                task_events: vec![],
                created_at: self.clock.now(),
            };
            task_store::insert_task(&mut ctx.tx, &task).await?;
            let mut machine = TaskStateMachine::new(task_id.clone(), Some(task), || false, self.clock.as_ref(), &mut ctx.queue, ScheduleStatus::Init);
            machine.update_state(ScheduleStatus::Pending, None, None);
            ids.insert(task_id);
        }
        Ok(ids)
    }

    pub(crate) async fn change_state_tx(
        &self,
        ctx: &mut TxContext,
        query: &TaskQuery,
        new_status: ScheduleStatus,
        audit_message: Option<String>,
    ) -> Result<usize> {
        let tasks = task_store::fetch_tasks(&mut ctx.tx, query).await?;
        let mut accepted = 0;
        for task in tasks {
            let status = task.status;
            let task_id = task.task_id.clone();
            let update_registered =
                update_store::fetch_job_update_config(&mut ctx.tx, &task.config.role, &task.config.job_name).await?.is_some();
            let mut machine =
                TaskStateMachine::new(task_id, Some(task), move || update_registered, self.clock.as_ref(), &mut ctx.queue, status);
            if machine.update_state(new_status, audit_message.clone(), None) {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    pub(crate) async fn fetch_tasks_tx(&self, ctx: &mut TxContext, query: &TaskQuery) -> Result<Vec<ScheduledTask>> {
        task_store::fetch_tasks(&mut ctx.tx, query).await
    }

    async fn assign_task_tx(
        &self,
        ctx: &mut TxContext,
        task_id: &str,
        slave_id: &str,
        slave_host: &str,
        available_ports: &BTreeSet<u32>,
    ) -> Result<ScheduledTask> {
        let Some(task) = fetch_one(&mut ctx.tx, task_id).await? else {
            return Err(SchedulerError::schedule(format!("no task matches {task_id}")));
        };
        if task.status != ScheduleStatus::Pending {
            return Err(SchedulerError::schedule(format!("task {task_id} is not PENDING")));
        }

        let mut ports = available_ports.iter().copied();
        let mut assigned_ports = BTreeMap::new();
        for name in &task.config.requested_ports {
            let port = ports.next().ok_or_else(|| SchedulerError::schedule("not enough ports offered"))?;
            assigned_ports.insert(name.clone(), port);
        }
        let placement =
            AssignedPlacement { slave_id: Some(slave_id.to_string()), slave_host: Some(slave_host.to_string()), assigned_ports };
        let mutation_placement = placement.clone();
        let mutation: TaskMutation = Box::new(move |t: &mut ScheduledTask| {
            t.placement = mutation_placement;
        });

        let status = task.status;
        let mut machine = TaskStateMachine::new(task_id.to_string(), Some(task.clone()), || false, self.clock.as_ref(), &mut ctx.queue, status);
        if !machine.update_state(ScheduleStatus::Assigned, None, Some(mutation)) {
            return Err(SchedulerError::invariant(format!("task {task_id} rejected ASSIGNED transition")));
        }

        let mut result = task;
        result.status = ScheduleStatus::Assigned;
        result.placement = placement;
        Ok(result)
    }

    async fn spawn_replacement(&self, ctx: &mut TxContext, ancestor_id: &str, config: TaskConfig) -> Result<String> {
        let task_id = new_task_id(&config.role, &config.job_name, config.shard_id);
        let task = ScheduledTask {
            task_id: task_id.clone(),
            status: ScheduleStatus::Init,
            config,
            placement: AssignedPlacement::default(),
            failure_count: 0,
            ancestor_id: Some(ancestor_id.to_string()),
            task_events: vec![],
            created_at: self.clock.now(),
        };
        task_store::insert_task(&mut ctx.tx, &task).await?;
        let mut machine = TaskStateMachine::new(task_id.clone(), Some(task), || false, self.clock.as_ref(), &mut ctx.queue, ScheduleStatus::Init);
        machine.update_state(ScheduleStatus::Pending, None, None);
        Ok(task_id)
    }

    async fn apply_reschedule_for_update(&self, ctx: &mut TxContext, task_id: &str, side: ConfigSide) -> Result<()> {
        let Some(old_task) = fetch_one(&mut ctx.tx, task_id).await? else {
            tracing::warn!(task_id, "update/rollback reschedule for a task that is no longer present, skipping");
            return Ok(());
        };
        let (role, job_name, shard_id) = old_task.job_shard_key();
        let Some(job_update) = update_store::fetch_job_update_config(&mut ctx.tx, &role, &job_name).await? else {
            tracing::warn!(task_id, %role, %job_name, "update configuration missing, racing with finishUpdate");
            return Ok(());
        };
        let Some(shard_config) = job_update.shard(shard_id) else {
            tracing::warn!(task_id, shard_id, "no shard entry for task in update configuration, skipping");
            return Ok(());
        };
        let target_config = match side {
            ConfigSide::GetNewConfig => shard_config.new_config.clone(),
            ConfigSide::GetOriginalConfig => shard_config.old_config.clone(),
        };
        let Some(config) = target_config else {
            tracing::info!(task_id, shard_id, "shard removed by the update, no replacement scheduled");
            return Ok(());
        };
        self.spawn_replacement(ctx, task_id, config).await?;
        Ok(())
    }

    async fn apply_command(&self, ctx: &mut TxContext, post_commit_kills: &mut Vec<String>, command: WorkCommand) -> Result<()> {
        match command {
            WorkCommand::Kill { task_id } => {
                post_commit_kills.push(task_id);
                Ok(())
            }
            WorkCommand::Reschedule { task_id } => {
                let Some(old_task) = fetch_one(&mut ctx.tx, &task_id).await? else {
                    tracing::warn!(%task_id, "reschedule for a task that is no longer present, skipping");
                    return Ok(());
                };
                self.spawn_replacement(ctx, &task_id, old_task.config).await?;
                Ok(())
            }
            WorkCommand::Update { task_id } => self.apply_reschedule_for_update(ctx, &task_id, ConfigSide::GetNewConfig).await,
            WorkCommand::Rollback { task_id } => self.apply_reschedule_for_update(ctx, &task_id, ConfigSide::GetOriginalConfig).await,
            WorkCommand::UpdateState { task_id, new_status, audit_message, mutation, timestamp } => {
                let Some(mut existing) = fetch_one(&mut ctx.tx, &task_id).await? else {
                    tracing::warn!(%task_id, "update_state work for a task that is no longer present, skipping");
                    return Ok(());
                };
                let old_status = existing.status;
                if let Some(mutate) = mutation {
                    mutate(&mut existing);
                }
                let next_seq = task_store::task_event_count(&mut ctx.tx, &task_id).await?;
                let event = crate::model::TaskEvent { timestamp, status: new_status.as_str().to_string(), message: audit_message };
                task_store::apply_status_change(&mut ctx.tx, &task_id, new_status, existing.failure_count, &existing.placement, next_seq, &event)
                    .await?;
                ctx.events.push(Event::TaskStateChange { task_id, old_status: Some(old_status), new_status });
                Ok(())
            }
            WorkCommand::Delete { task_id } => {
                task_store::delete_task(&mut ctx.tx, &task_id).await?;
                ctx.events.push(Event::TasksDeleted { task_ids: vec![task_id] });
                Ok(())
            }
            WorkCommand::IncrementFailures { task_id } => task_store::increment_failure_count(&mut ctx.tx, &task_id).await,
        }
    }
}

async fn fetch_one(tx: &mut Transaction<'static, Sqlite>, task_id: &str) -> Result<Option<ScheduledTask>> {
    let mut tasks = task_store::fetch_tasks(&mut *tx, &TaskQuery::by_id(task_id)).await?;
    Ok(tasks.pop())
}

/// Apply +/-10% jitter to a backoff duration so a burst of concurrent
/// `kill_tasks` callers don't all re-poll in lockstep.
fn jittered(duration: std::time::Duration) -> std::time::Duration {
    let factor: f64 = rand::rng().random_range(0.9..1.1);
    duration.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::driver::RecordingDriver;
    use crate::events::LoggingEventSink;
    use crate::model::Constraint;
    use pretty_assertions::assert_eq;

    async fn manager() -> StateManager {
        let storage = Storage::open_in_memory().await.expect("open storage");
        StateManager::new(
            storage,
            Arc::new(RecordingDriver::new()),
            Arc::new(LoggingEventSink),
            Arc::new(SystemClock),
            SchedulerConfig::default(),
        )
    }

    fn config(role: &str, job: &str, shard: u32) -> TaskConfig {
        TaskConfig {
            role: role.into(),
            environment: "prod".into(),
            job_name: job.into(),
            shard_id: shard,
            requested_ports: vec!["http".into()],
            num_cpus: 1.0,
            ram_mb: 256,
            disk_mb: 512,
            is_service: true,
            max_task_failures: 3,
            constraints: Vec::<Constraint>::new(),
        }
    }

    #[tokio::test]
    async fn create_assign_run_scenario() {
        let manager = manager().await;
        let ids = manager.insert_tasks(vec![config("r", "j", 0)]).await.expect("insert");
        assert_eq!(ids.len(), 1);
        let task_id = ids.into_iter().next().unwrap();

        let tasks = manager.fetch_tasks(&TaskQuery::by_id(&task_id)).await.expect("fetch");
        assert_eq!(tasks[0].status, ScheduleStatus::Pending);

        let mut ports = BTreeSet::new();
        ports.insert(31000);
        let assigned = manager.assign_task(&task_id, "s1", "h1", &ports).await.expect("assign");
        assert_eq!(assigned.status, ScheduleStatus::Assigned);
        assert_eq!(assigned.placement.assigned_ports.get("http"), Some(&31000));
    }

    #[tokio::test]
    async fn insert_tasks_rejected_when_job_creation_disabled() {
        let storage = Storage::open_in_memory().await.expect("open storage");
        let mut disabled = SchedulerConfig::default();
        disabled.enable_job_creation = false;
        let manager =
            StateManager::new(storage, Arc::new(RecordingDriver::new()), Arc::new(LoggingEventSink), Arc::new(SystemClock), disabled);
        let result = manager.insert_tasks(vec![config("r", "j", 0)]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_task_under_limit_is_rescheduled_with_ancestor() {
        let manager = manager().await;
        let ids = manager.insert_tasks(vec![config("r", "j", 0)]).await.expect("insert");
        let task_id = ids.into_iter().next().unwrap();

        let mut ports = BTreeSet::new();
        ports.insert(31000);
        manager.assign_task(&task_id, "s1", "h1", &ports).await.expect("assign");
        manager.change_state(TaskQuery::by_id(&task_id), ScheduleStatus::Starting, None).await.expect("starting");
        manager.change_state(TaskQuery::by_id(&task_id), ScheduleStatus::Running, None).await.expect("running");
        manager.change_state(TaskQuery::by_id(&task_id), ScheduleStatus::Failed, None).await.expect("failed");

        let replacement = manager
            .fetch_tasks(&TaskQuery::for_job("r", "j").with_statuses([ScheduleStatus::Pending].into()))
            .await
            .expect("fetch replacement");
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].ancestor_id.as_deref(), Some(task_id.as_str()));
    }
}
