//! The task record and its declared configuration.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use super::attribute::Constraint;

/// The lifecycle states a task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ScheduleStatus {
    Init,
    Pending,
    Assigned,
    Starting,
    Running,
    Failed,
    Finished,
    Killed,
    Killing,
    Lost,
    Restarting,
    Updating,
    Rollback,
    Preempting,
    Unknown,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn parse(value: &str) -> crate::error::Result<Self> {
        value.parse().map_err(|_| crate::error::SchedulerError::invariant(format!("invalid schedule status: {value}")))
    }

    /// Whether a task in this state counts toward the "at most one active
    /// task per (role, job, shard)" invariant.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Assigned
                | Self::Starting
                | Self::Running
                | Self::Updating
                | Self::Rollback
                | Self::Killing
                | Self::Preempting
                | Self::Restarting
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Finished | Self::Killed | Self::Lost)
    }
}

/// A single entry in a task's append-only audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub message: Option<String>,
}

/// The declared configuration of a task, as submitted by a job owner.
///
/// This is the part of a task that a rolling update compares old vs. new on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub role: String,
    pub environment: String,
    pub job_name: String,
    pub shard_id: u32,
    pub requested_ports: Vec<String>,
    pub num_cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub is_service: bool,
    pub max_task_failures: i32,
    pub constraints: Vec<Constraint>,
}

/// Placement info populated on `ASSIGN`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignedPlacement {
    pub slave_id: Option<String>,
    pub slave_host: Option<String>,
    /// Port name -> allocated port number.
    pub assigned_ports: BTreeMap<String, u32>,
}

/// A task record, owned exclusively by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub status: ScheduleStatus,
    pub config: TaskConfig,
    pub placement: AssignedPlacement,
    pub failure_count: i32,
    pub ancestor_id: Option<String>,
    pub task_events: Vec<TaskEvent>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn job_shard_key(&self) -> (String, String, u32) {
        (self.config.role.clone(), self.config.job_name.clone(), self.config.shard_id)
    }
}

/// A structured predicate over tasks; translated by the store to index
/// lookups rather than a full scan where possible.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub role: Option<String>,
    pub environment: Option<String>,
    pub job_name: Option<String>,
    pub shard_ids: Option<BTreeSet<u32>>,
    pub statuses: Option<BTreeSet<ScheduleStatus>>,
    pub task_ids: Option<BTreeSet<String>>,
    pub slave_host: Option<String>,
}

impl TaskQuery {
    pub fn for_job(role: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self { role: Some(role.into()), job_name: Some(job_name.into()), ..Default::default() }
    }

    pub fn by_id(task_id: impl Into<String>) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(task_id.into());
        Self { task_ids: Some(ids), ..Default::default() }
    }

    pub fn with_shards(mut self, shards: BTreeSet<u32>) -> Self {
        self.shard_ids = Some(shards);
        self
    }

    pub fn with_statuses(mut self, statuses: BTreeSet<ScheduleStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn active_only(self) -> Self {
        self.with_statuses(ScheduleStatus::active_variants())
    }
}

impl ScheduleStatus {
    /// All statuses considered active, as a set (used by `TaskQuery::active_only`).
    pub fn active_variants() -> BTreeSet<ScheduleStatus> {
        [
            Self::Pending,
            Self::Assigned,
            Self::Starting,
            Self::Running,
            Self::Updating,
            Self::Rollback,
            Self::Killing,
            Self::Preempting,
            Self::Restarting,
        ]
        .into_iter()
        .collect()
    }
}

/// Flat row shape for the `tasks` table; `config_json`/`assigned_ports_json`
/// carry the parts of [`ScheduledTask`] that don't map to their own columns.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub(crate) task_id: String,
    pub(crate) status: String,
    pub(crate) failure_count: i64,
    pub(crate) ancestor_id: Option<String>,
    pub(crate) config_json: String,
    pub(crate) slave_id: Option<String>,
    pub(crate) slave_host: Option<String>,
    pub(crate) assigned_ports_json: Option<String>,
    pub(crate) created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskEventRow {
    pub(crate) status: String,
    pub(crate) timestamp: i64,
    pub(crate) message: Option<String>,
}

impl TryFrom<TaskEventRow> for TaskEvent {
    type Error = crate::error::SchedulerError;

    fn try_from(value: TaskEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: epoch_millis_to_datetime(value.timestamp)?,
            status: value.status,
            message: value.message,
        })
    }
}

pub(crate) fn task_from_row(row: TaskRow, events: Vec<TaskEvent>) -> crate::error::Result<ScheduledTask> {
    let config: TaskConfig = serde_json::from_str(&row.config_json)
        .map_err(|e| crate::error::SchedulerError::invariant(format!("corrupt task config: {e}")))?;
    let assigned_ports = row
        .assigned_ports_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| crate::error::SchedulerError::invariant(format!("corrupt assigned ports: {e}")))?
        .unwrap_or_default();
    Ok(ScheduledTask {
        task_id: row.task_id,
        status: ScheduleStatus::parse(&row.status)?,
        config,
        placement: AssignedPlacement { slave_id: row.slave_id, slave_host: row.slave_host, assigned_ports },
        failure_count: row.failure_count as i32,
        ancestor_id: row.ancestor_id,
        task_events: events,
        created_at: epoch_millis_to_datetime(row.created_at)?,
    })
}

pub(crate) fn epoch_millis_to_datetime(millis: i64) -> crate::error::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| crate::error::SchedulerError::invariant(format!("invalid timestamp: {millis}")))
}
