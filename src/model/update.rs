//! Rolling-update coordination records.

use serde::{Deserialize, Serialize};

use super::task::TaskConfig;

/// Per-shard old/new configuration pair for an in-progress update.
///
/// Either side may be absent: a shard present only in `new_config` was
/// added by the update, one present only in `old_config` was removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdateConfiguration {
    pub shard_id: u32,
    pub old_config: Option<TaskConfig>,
    pub new_config: Option<TaskConfig>,
}

/// The registered update for a single (role, job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdateConfiguration {
    pub role: String,
    pub job_name: String,
    pub update_token: String,
    pub shards: Vec<TaskUpdateConfiguration>,
}

impl JobUpdateConfiguration {
    pub fn shard(&self, shard_id: u32) -> Option<&TaskUpdateConfiguration> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }
}

/// Which side of a `TaskUpdateConfiguration` a shard mutation should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSide {
    GetNewConfig,
    GetOriginalConfig,
}

/// The per-shard outcome of `modify_shards`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardUpdateResult {
    Added,
    Restarting,
    Unchanged,
}

/// The outcome a caller reports to `finish_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    Failed,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskUpdateConfigRow {
    pub(crate) shard_id: i64,
    pub(crate) old_config_json: Option<String>,
    pub(crate) new_config_json: Option<String>,
}

impl TryFrom<TaskUpdateConfigRow> for TaskUpdateConfiguration {
    type Error = crate::error::SchedulerError;

    fn try_from(value: TaskUpdateConfigRow) -> Result<Self, Self::Error> {
        let parse = |json: Option<String>| -> crate::error::Result<Option<TaskConfig>> {
            json.as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| crate::error::SchedulerError::invariant(format!("corrupt shard config: {e}")))
        };
        Ok(Self {
            shard_id: value.shard_id as u32,
            old_config: parse(value.old_config_json)?,
            new_config: parse(value.new_config_json)?,
        })
    }
}
