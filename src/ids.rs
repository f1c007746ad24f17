//! Task id generation.
//!
//! Format: `<epochMillis>-<role>-<jobName>-<shardId>-<uuid>`, with any
//! character outside `[A-Za-z0-9_-]` in the composed string replaced by `-`.
//! Chronological sort of ids reflects creation order because the epoch
//! millis component is left-padded implicitly by using a fixed-width decimal
//! representation of a 64-bit millisecond timestamp.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a task id for a new task belonging to `(role, job_name, shard_id)`.
///
/// `now` and `uuid` are passed in so tests can exercise the formatting and
/// sanitization rules without depending on wall-clock time or random state.
pub fn generate_task_id(role: &str, job_name: &str, shard_id: u32, now: DateTime<Utc>, uuid: Uuid) -> String {
    let raw = format!(
        "{}-{role}-{job_name}-{shard_id}-{uuid}",
        now.timestamp_millis()
    );
    sanitize(&raw)
}

/// Generate a task id using the system clock and a fresh random uuid.
pub fn new_task_id(role: &str, job_name: &str, shard_id: u32) -> String {
    generate_task_id(role, job_name, shard_id, Utc::now(), Uuid::new_v4())
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' { ch } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 123_000_000).expect("timestamp")
    }

    fn fixed_uuid() -> Uuid {
        Uuid::parse_str("11111111-2222-3333-4444-555555555555").expect("uuid")
    }

    #[test]
    fn formats_components_in_order() {
        let id = generate_task_id("role", "job", 3, fixed_now(), fixed_uuid());
        assert_eq!(
            id,
            format!(
                "{}-role-job-3-11111111-2222-3333-4444-555555555555",
                fixed_now().timestamp_millis()
            )
        );
    }

    #[test]
    fn replaces_non_word_dash_characters() {
        let id = generate_task_id("r.oot", "my job", 0, fixed_now(), fixed_uuid());
        assert!(id.contains("-r-oot-"));
        assert!(id.contains("-my-job-"));
        assert!(id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'));
    }

    #[test]
    fn ids_sort_chronologically() {
        let earlier = generate_task_id("r", "j", 0, fixed_now(), fixed_uuid());
        let later_ts = DateTime::<Utc>::from_timestamp(1_700_000_001, 0).expect("timestamp");
        let later = generate_task_id("r", "j", 0, later_ts, fixed_uuid());
        assert!(earlier < later);
    }

    #[test]
    fn distinct_uuids_avoid_collisions_at_same_millisecond() {
        let a = generate_task_id("r", "j", 0, fixed_now(), Uuid::new_v4());
        let b = generate_task_id("r", "j", 0, fixed_now(), Uuid::new_v4());
        assert_ne!(a, b);
    }
}
