//! Scheduler-wide tunables. Plain data plus `Default`, matching the
//! teacher's config structs rather than a builder or env-parsing framework.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether `StateManager::insert_tasks` is permitted to create new jobs.
    /// Disabling this lets an operator drain a cluster without rejecting
    /// reschedules of already-known jobs.
    pub enable_job_creation: bool,
    #[serde(with = "duration_millis")]
    pub kill_task_initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub kill_task_max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_job_creation: true,
            kill_task_initial_backoff: Duration::from_secs(1),
            kill_task_max_backoff: Duration::from_secs(30),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.kill_task_initial_backoff, Duration::from_secs(1));
        assert_eq!(config.kill_task_max_backoff, Duration::from_secs(30));
        assert!(config.enable_job_creation);
    }
}
