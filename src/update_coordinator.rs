//! Rolling-update registration, shard-level drive, and idempotent finish.
//!
//! Everything here runs through [`StateManager::run_write`] so that the
//! update-config precondition checks and the task mutations they trigger
//! land in the same transaction: either the whole step commits, or none of
//! it does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::model::{
    ConfigSide, JobUpdateConfiguration, ScheduleStatus, ScheduledTask, ShardUpdateResult, TaskConfig, TaskQuery,
    TaskUpdateConfiguration, UpdateOutcome,
};
use crate::state_manager::{StateManager, TxContext};
use crate::store::update_store;

/// Drives rolling updates for a single (role, job) at a time. Stateless
/// beyond the `StateManager` it delegates all persistence and state-machine
/// work to.
pub struct UpdateCoordinator {
    state_manager: Arc<StateManager>,
}

impl UpdateCoordinator {
    pub fn new(state_manager: Arc<StateManager>) -> Self {
        Self { state_manager }
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state_manager
    }

    /// Register a rolling update from the job's current active shard
    /// configs to `new_configs`, diffed by shard id. Fails if an update is
    /// already registered, if the job has no active tasks, or if any shard
    /// is already mid-update.
    pub async fn register_update(&self, role: &str, job_name: &str, new_configs: Vec<TaskConfig>) -> Result<String> {
        let role = role.to_string();
        let job_name = job_name.to_string();
        self.state_manager
            .run_write(move |ctx| Box::pin(async move { self.register_update_tx(ctx, &role, &job_name, new_configs).await }))
            .await
    }

    async fn register_update_tx(
        &self,
        ctx: &mut TxContext,
        role: &str,
        job_name: &str,
        new_configs: Vec<TaskConfig>,
    ) -> Result<String> {
        let active = self.state_manager.fetch_tasks_tx(ctx, &TaskQuery::for_job(role, job_name).active_only()).await?;
        if active.iter().any(|t| matches!(t.status, ScheduleStatus::Updating | ScheduleStatus::Rollback)) {
            return Err(SchedulerError::update(format!("{role}/{job_name} has shards mid-update, cannot register another")));
        }
        if active.is_empty() {
            return Err(SchedulerError::update(format!("no active tasks for {role}/{job_name}")));
        }
        if update_store::fetch_job_update_config(&mut ctx.tx, role, job_name).await?.is_some() {
            return Err(SchedulerError::update(format!("update already in progress for {role}/{job_name}")));
        }

        let mut old_by_shard: BTreeMap<u32, TaskConfig> = BTreeMap::new();
        for task in &active {
            old_by_shard.insert(task.config.shard_id, task.config.clone());
        }
        let mut new_by_shard: BTreeMap<u32, TaskConfig> = BTreeMap::new();
        for config in new_configs {
            new_by_shard.insert(config.shard_id, config);
        }

        let shard_ids: BTreeSet<u32> = old_by_shard.keys().chain(new_by_shard.keys()).copied().collect();
        let shards = shard_ids
            .into_iter()
            .map(|shard_id| TaskUpdateConfiguration {
                shard_id,
                old_config: old_by_shard.get(&shard_id).cloned(),
                new_config: new_by_shard.get(&shard_id).cloned(),
            })
            .collect();

        let update_token = Uuid::new_v4().to_string();
        let job_update = JobUpdateConfiguration {
            role: role.to_string(),
            job_name: job_name.to_string(),
            update_token: update_token.clone(),
            shards,
        };
        update_store::save_job_update_config(&mut ctx.tx, &job_update).await?;
        Ok(update_token)
    }

    /// Drive `shards` toward `updating`'s new config (or the original config
    /// when rolling back), adding shards with no active task, restarting
    /// shards whose config changed, and leaving the rest alone.
    pub async fn modify_shards(
        &self,
        role: &str,
        job_name: &str,
        shards: BTreeSet<u32>,
        token: &str,
        updating: bool,
        user: &str,
    ) -> Result<BTreeMap<u32, ShardUpdateResult>> {
        let role = role.to_string();
        let job_name = job_name.to_string();
        let token = token.to_string();
        let user = user.to_string();
        self.state_manager
            .run_write(move |ctx| {
                Box::pin(async move { self.modify_shards_tx(ctx, &role, &job_name, &shards, &token, updating, &user).await })
            })
            .await
    }

    async fn modify_shards_tx(
        &self,
        ctx: &mut TxContext,
        role: &str,
        job_name: &str,
        shards: &BTreeSet<u32>,
        token: &str,
        updating: bool,
        user: &str,
    ) -> Result<BTreeMap<u32, ShardUpdateResult>> {
        if shards.is_empty() {
            return Ok(BTreeMap::new());
        }

        let Some(job_update) = update_store::fetch_job_update_config(&mut ctx.tx, role, job_name).await? else {
            return Err(SchedulerError::update(format!("no update registered for {role}/{job_name}")));
        };
        if job_update.update_token != token {
            return Err(SchedulerError::update("update token does not match"));
        }
        let side = if updating { ConfigSide::GetNewConfig } else { ConfigSide::GetOriginalConfig };

        let query = TaskQuery::for_job(role, job_name).with_shards(shards.clone()).active_only();
        let active = self.state_manager.fetch_tasks_tx(ctx, &query).await?;
        let active_by_shard: BTreeMap<u32, ScheduledTask> = active.into_iter().map(|t| (t.config.shard_id, t)).collect();

        let (new_shard_ids, update_shard_ids): (Vec<u32>, Vec<u32>) =
            shards.iter().copied().partition(|shard_id| !active_by_shard.contains_key(shard_id));

        let mut result = BTreeMap::new();

        let mut new_configs = Vec::new();
        for shard_id in &new_shard_ids {
            let target = job_update
                .shard(*shard_id)
                .and_then(|shard_cfg| match side {
                    ConfigSide::GetNewConfig => shard_cfg.new_config.clone(),
                    ConfigSide::GetOriginalConfig => shard_cfg.old_config.clone(),
                })
                .ok_or_else(|| SchedulerError::update("unrecognized shards"))?;
            new_configs.push(target);
        }
        if !new_configs.is_empty() {
            self.state_manager.insert_tasks_tx(ctx, new_configs).await?;
        }
        for shard_id in &new_shard_ids {
            result.insert(*shard_id, ShardUpdateResult::Added);
        }

        let audit_message = if updating { format!("Updated by {user}") } else { format!("Rolled back by {user}") };
        let target_status = if updating { ScheduleStatus::Updating } else { ScheduleStatus::Rollback };

        for shard_id in &update_shard_ids {
            let task = &active_by_shard[shard_id];
            if matches!(task.status, ScheduleStatus::Updating | ScheduleStatus::Rollback) {
                // Already being driven by a prior modify_shards call; don't
                // double-drive the machine, just report it as in-flight.
                result.insert(*shard_id, ShardUpdateResult::Restarting);
                continue;
            }
            let shard_cfg = job_update.shard(*shard_id).ok_or_else(|| SchedulerError::update("unrecognized shards"))?;
            let target_config = match side {
                ConfigSide::GetNewConfig => shard_cfg.new_config.as_ref(),
                ConfigSide::GetOriginalConfig => shard_cfg.old_config.as_ref(),
            };
            if target_config == Some(&task.config) {
                result.insert(*shard_id, ShardUpdateResult::Unchanged);
                continue;
            }
            self.state_manager
                .change_state_tx(ctx, &TaskQuery::by_id(&task.task_id), target_status, Some(audit_message.clone()))
                .await?;
            result.insert(*shard_id, ShardUpdateResult::Restarting);
        }

        Ok(result)
    }

    /// Idempotently finish the registered update: returns `Ok(false)`
    /// instead of erroring when no update is registered and
    /// `throw_if_missing` is false, so callers can call this twice in a row
    /// safely.
    pub async fn finish_update(
        &self,
        role: &str,
        job_name: &str,
        token: Option<String>,
        outcome: UpdateOutcome,
        throw_if_missing: bool,
        user: &str,
    ) -> Result<bool> {
        let role = role.to_string();
        let job_name = job_name.to_string();
        let user = user.to_string();
        self.state_manager
            .run_write(move |ctx| {
                Box::pin(async move {
                    self.finish_update_tx(ctx, &role, &job_name, token.as_deref(), outcome, throw_if_missing, &user).await
                })
            })
            .await
    }

    async fn finish_update_tx(
        &self,
        ctx: &mut TxContext,
        role: &str,
        job_name: &str,
        token: Option<&str>,
        outcome: UpdateOutcome,
        throw_if_missing: bool,
        user: &str,
    ) -> Result<bool> {
        let active = self.state_manager.fetch_tasks_tx(ctx, &TaskQuery::for_job(role, job_name).active_only()).await?;
        if active.iter().any(|t| matches!(t.status, ScheduleStatus::Updating | ScheduleStatus::Rollback)) {
            return Err(SchedulerError::update(format!("{role}/{job_name} still has shards mid-update")));
        }

        let Some(job_update) = update_store::fetch_job_update_config(&mut ctx.tx, role, job_name).await? else {
            return if throw_if_missing {
                Err(SchedulerError::update(format!("no update registered for {role}/{job_name}")))
            } else {
                Ok(false)
            };
        };

        if let Some(token) = token {
            if job_update.update_token != token {
                return Err(SchedulerError::update("update token does not match"));
            }
        }

        let active_by_shard: BTreeMap<u32, &ScheduledTask> = active.iter().map(|t| (t.config.shard_id, t)).collect();
        for shard in &job_update.shards {
            let kept_side_missing = match outcome {
                UpdateOutcome::Success => shard.new_config.is_none(),
                UpdateOutcome::Failed => shard.old_config.is_none(),
            };
            if !kept_side_missing {
                continue;
            }
            if let Some(task) = active_by_shard.get(&shard.shard_id) {
                self.state_manager
                    .change_state_tx(
                        ctx,
                        &TaskQuery::by_id(&task.task_id),
                        ScheduleStatus::Killing,
                        Some(format!("Removed during update by {user}")),
                    )
                    .await?;
            }
        }

        update_store::remove_job_update_config(&mut ctx.tx, role, job_name).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::SchedulerConfig;
    use crate::driver::RecordingDriver;
    use crate::events::LoggingEventSink;
    use crate::model::Constraint;
    use crate::store::Storage;
    use pretty_assertions::assert_eq;

    fn config(role: &str, job: &str, shard: u32, ram_mb: u64) -> TaskConfig {
        TaskConfig {
            role: role.into(),
            environment: "prod".into(),
            job_name: job.into(),
            shard_id: shard,
            requested_ports: vec![],
            num_cpus: 1.0,
            ram_mb,
            disk_mb: 512,
            is_service: true,
            max_task_failures: 3,
            constraints: Vec::<Constraint>::new(),
        }
    }

    async fn harness() -> (Arc<StateManager>, UpdateCoordinator) {
        let storage = Storage::open_in_memory().await.expect("open storage");
        let state_manager = Arc::new(StateManager::new(
            storage,
            Arc::new(RecordingDriver::new()),
            Arc::new(LoggingEventSink),
            Arc::new(SystemClock),
            SchedulerConfig::default(),
        ));
        let coordinator = UpdateCoordinator::new(state_manager.clone());
        (state_manager, coordinator)
    }

    #[tokio::test]
    async fn register_update_diffs_added_and_removed_shards() {
        let (state_manager, coordinator) = harness().await;
        state_manager.insert_tasks(vec![config("r", "j", 0, 256), config("r", "j", 1, 256), config("r", "j", 2, 256)]).await.unwrap();

        let token = coordinator.register_update("r", "j", vec![config("r", "j", 0, 512), config("r", "j", 1, 256)]).await.unwrap();
        assert!(!token.is_empty());

        let mut conn = state_manager.storage().acquire().await.unwrap();
        let stored = crate::store::update_store::fetch_job_update_config(&mut conn, "r", "j").await.unwrap().unwrap();
        assert_eq!(stored.shards.len(), 3);
        let shard2 = stored.shard(2).unwrap();
        assert!(shard2.old_config.is_some());
        assert!(shard2.new_config.is_none());
    }

    #[tokio::test]
    async fn register_update_rejects_concurrent_registration() {
        let (state_manager, coordinator) = harness().await;
        state_manager.insert_tasks(vec![config("r", "j", 0, 256)]).await.unwrap();
        coordinator.register_update("r", "j", vec![config("r", "j", 0, 512)]).await.unwrap();

        let second = coordinator.register_update("r", "j", vec![config("r", "j", 0, 512)]).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn modify_shards_with_empty_set_is_a_no_op() {
        let (state_manager, coordinator) = harness().await;
        state_manager.insert_tasks(vec![config("r", "j", 0, 256)]).await.unwrap();
        let token = coordinator.register_update("r", "j", vec![config("r", "j", 0, 512)]).await.unwrap();

        let result = coordinator.modify_shards("r", "j", BTreeSet::new(), &token, true, "alice").await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn modify_shards_rejects_unrecognized_shard() {
        let (state_manager, coordinator) = harness().await;
        state_manager.insert_tasks(vec![config("r", "j", 0, 256), config("r", "j", 1, 256)]).await.unwrap();
        let token = coordinator.register_update("r", "j", vec![config("r", "j", 0, 512), config("r", "j", 1, 512)]).await.unwrap();

        let shards: BTreeSet<u32> = [0, 1, 2].into_iter().collect();
        let result = coordinator.modify_shards("r", "j", shards, &token, true, "alice").await;
        assert!(result.is_err());

        let tasks = state_manager.fetch_tasks(&TaskQuery::for_job("r", "j")).await.unwrap();
        assert!(tasks.iter().all(|t| t.status != ScheduleStatus::Updating));
        assert_eq!(tasks.len(), 2);
    }

    #[tokio::test]
    async fn modify_shards_drives_changed_and_reports_unchanged() {
        let (state_manager, coordinator) = harness().await;
        state_manager.insert_tasks(vec![config("r", "j", 0, 256), config("r", "j", 1, 256)]).await.unwrap();
        let token = coordinator.register_update("r", "j", vec![config("r", "j", 0, 512), config("r", "j", 1, 256)]).await.unwrap();

        let shards: BTreeSet<u32> = [0, 1].into_iter().collect();
        let result = coordinator.modify_shards("r", "j", shards, &token, true, "alice").await.unwrap();
        assert_eq!(result.get(&0), Some(&ShardUpdateResult::Restarting));
        assert_eq!(result.get(&1), Some(&ShardUpdateResult::Unchanged));

        let tasks = state_manager.fetch_tasks(&TaskQuery::for_job("r", "j")).await.unwrap();
        let shard0 = tasks.iter().find(|t| t.config.shard_id == 0).unwrap();
        assert_eq!(shard0.status, ScheduleStatus::Updating);
    }

    #[tokio::test]
    async fn finish_update_is_idempotent() {
        let (state_manager, coordinator) = harness().await;
        state_manager.insert_tasks(vec![config("r", "j", 0, 256)]).await.unwrap();
        let token = coordinator.register_update("r", "j", vec![config("r", "j", 0, 512)]).await.unwrap();

        let first = coordinator.finish_update("r", "j", Some(token), UpdateOutcome::Success, false, "alice").await.unwrap();
        assert!(first);
        let second = coordinator.finish_update("r", "j", None, UpdateOutcome::Success, false, "alice").await.unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn finish_update_with_success_kills_shards_removed_by_update() {
        let (state_manager, coordinator) = harness().await;
        state_manager.insert_tasks(vec![config("r", "j", 0, 256), config("r", "j", 1, 256)]).await.unwrap();
        // New config only covers shard 0; shard 1 is removed by the update.
        let token = coordinator.register_update("r", "j", vec![config("r", "j", 0, 512)]).await.unwrap();

        coordinator.finish_update("r", "j", Some(token), UpdateOutcome::Success, true, "alice").await.unwrap();

        let tasks = state_manager.fetch_tasks(&TaskQuery::for_job("r", "j")).await.unwrap();
        let shard1 = tasks.iter().find(|t| t.config.shard_id == 1).unwrap();
        assert_eq!(shard1.status, ScheduleStatus::Killing);
    }
}
