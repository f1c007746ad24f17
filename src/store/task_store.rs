//! Task CRUD against the `tasks` / `task_events` tables.
//!
//! Every function takes a `&mut SqliteConnection` rather than a concrete
//! `Storage`, so callers can run them against either a pooled connection
//! (reads) or an open transaction (writes) by reborrowing — `Transaction`
//! and `PoolConnection` both deref to `SqliteConnection`.

use sqlx::SqliteConnection;

use crate::error::Result;
use crate::model::{
    task_from_row, AssignedPlacement, ScheduleStatus, ScheduledTask, TaskEvent, TaskEventRow, TaskQuery, TaskRow,
};

/// Insert a brand-new task row. No `task_events` row is written here — the
/// caller is expected to have already placed the task in `INIT`, and the
/// first audit event is appended when the `INIT -> PENDING` `UpdateState`
/// work lands.
pub async fn insert_task(conn: &mut SqliteConnection, task: &ScheduledTask) -> Result<()> {
    let config_json = serde_json::to_string(&task.config)
        .map_err(|e| crate::error::SchedulerError::invariant(format!("cannot serialize config: {e}")))?;
    sqlx::query(
        "INSERT INTO tasks (task_id, role, environment, job_name, shard_id, status, failure_count, \
         ancestor_id, config_json, slave_id, slave_host, assigned_ports_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.task_id)
    .bind(&task.config.role)
    .bind(&task.config.environment)
    .bind(&task.config.job_name)
    .bind(task.config.shard_id as i64)
    .bind(task.status.as_str())
    .bind(task.failure_count as i64)
    .bind(&task.ancestor_id)
    .bind(config_json)
    .bind(&task.placement.slave_id)
    .bind(&task.placement.slave_host)
    .bind(None::<String>)
    .bind(task.created_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append an audit event and update status/failure_count/placement in one
/// call. `next_seq` should be the number of events the task already has,
/// since `task_events.seq` is a plain append counter.
#[allow(clippy::too_many_arguments)]
pub async fn apply_status_change(
    conn: &mut SqliteConnection,
    task_id: &str,
    new_status: ScheduleStatus,
    failure_count: i32,
    placement: &AssignedPlacement,
    next_seq: i64,
    event: &TaskEvent,
) -> Result<()> {
    let assigned_ports_json = if placement.assigned_ports.is_empty() {
        None
    } else {
        Some(
            serde_json::to_string(&placement.assigned_ports)
                .map_err(|e| crate::error::SchedulerError::invariant(format!("cannot serialize ports: {e}")))?,
        )
    };
    sqlx::query(
        "UPDATE tasks SET status = ?, failure_count = ?, slave_id = ?, slave_host = ?, assigned_ports_json = ? \
         WHERE task_id = ?",
    )
    .bind(new_status.as_str())
    .bind(failure_count as i64)
    .bind(&placement.slave_id)
    .bind(&placement.slave_host)
    .bind(assigned_ports_json)
    .bind(task_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO task_events (task_id, seq, status, timestamp, message) VALUES (?, ?, ?, ?, ?)")
        .bind(task_id)
        .bind(next_seq)
        .bind(new_status.as_str())
        .bind(event.timestamp.timestamp_millis())
        .bind(&event.message)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_task(conn: &mut SqliteConnection, task_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM task_events WHERE task_id = ?").bind(task_id).execute(&mut *conn).await?;
    sqlx::query("DELETE FROM tasks WHERE task_id = ?").bind(task_id).execute(&mut *conn).await?;
    Ok(())
}

pub async fn increment_failure_count(conn: &mut SqliteConnection, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET failure_count = failure_count + 1 WHERE task_id = ?")
        .bind(task_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn task_event_count(conn: &mut SqliteConnection, task_id: &str) -> Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_events WHERE task_id = ?")
        .bind(task_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.0)
}

/// Fetch every task matching `query`, each with its full event history.
pub async fn fetch_tasks(conn: &mut SqliteConnection, query: &TaskQuery) -> Result<Vec<ScheduledTask>> {
    let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT * FROM tasks WHERE 1 = 1");
    push_filters(&mut builder, query);
    builder.push(" ORDER BY task_id");

    let rows: Vec<TaskRow> = builder.build_query_as().fetch_all(&mut *conn).await?;
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let event_rows: Vec<TaskEventRow> =
            sqlx::query_as("SELECT status, timestamp, message FROM task_events WHERE task_id = ? ORDER BY seq")
                .bind(&row.task_id)
                .fetch_all(&mut *conn)
                .await?;
        let events = event_rows.into_iter().map(TaskEvent::try_from).collect::<Result<Vec<_>>>()?;
        tasks.push(task_from_row(row, events)?);
    }
    Ok(tasks)
}

/// Fetch only task ids, skipping the event-history join; used by callers
/// that don't need audit history (e.g. the update coordinator's diffing).
pub async fn fetch_task_ids(conn: &mut SqliteConnection, query: &TaskQuery) -> Result<Vec<String>> {
    let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT task_id FROM tasks WHERE 1 = 1");
    push_filters(&mut builder, query);
    builder.push(" ORDER BY task_id");
    let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&mut *conn).await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

fn push_filters<'a>(builder: &mut sqlx::QueryBuilder<'a, sqlx::Sqlite>, query: &'a TaskQuery) {
    if let Some(role) = &query.role {
        builder.push(" AND role = ").push_bind(role);
    }
    if let Some(environment) = &query.environment {
        builder.push(" AND environment = ").push_bind(environment);
    }
    if let Some(job_name) = &query.job_name {
        builder.push(" AND job_name = ").push_bind(job_name);
    }
    if let Some(host) = &query.slave_host {
        builder.push(" AND slave_host = ").push_bind(host);
    }
    if let Some(shard_ids) = &query.shard_ids {
        if shard_ids.is_empty() {
            builder.push(" AND 0 = 1");
        } else {
            builder.push(" AND shard_id IN (");
            let mut separated = builder.separated(", ");
            for shard in shard_ids {
                separated.push_bind(*shard as i64);
            }
            separated.push_unseparated(")");
        }
    }
    if let Some(task_ids) = &query.task_ids {
        if task_ids.is_empty() {
            builder.push(" AND 0 = 1");
        } else {
            builder.push(" AND task_id IN (");
            let mut separated = builder.separated(", ");
            for id in task_ids {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
        }
    }
    if let Some(statuses) = &query.statuses {
        if statuses.is_empty() {
            builder.push(" AND 0 = 1");
        } else {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
    }
}

