//! Rolling-update configuration CRUD against `job_update_configs` /
//! `task_update_configs`.

use sqlx::SqliteConnection;

use crate::error::Result;
use crate::model::{JobUpdateConfiguration, TaskUpdateConfigRow, TaskUpdateConfiguration};

/// Persist a freshly registered update, replacing any prior one for the same
/// (role, job) — `registerUpdate` supersedes, it does not merge.
pub async fn save_job_update_config(conn: &mut SqliteConnection, config: &JobUpdateConfiguration) -> Result<()> {
    remove_job_update_config(&mut *conn, &config.role, &config.job_name).await?;

    sqlx::query("INSERT INTO job_update_configs (role, job_name, update_token) VALUES (?, ?, ?)")
        .bind(&config.role)
        .bind(&config.job_name)
        .bind(&config.update_token)
        .execute(&mut *conn)
        .await?;

    for shard in &config.shards {
        save_shard_update_config(&mut *conn, &config.role, &config.job_name, shard).await?;
    }
    Ok(())
}

pub async fn save_shard_update_config(
    conn: &mut SqliteConnection,
    role: &str,
    job_name: &str,
    shard: &TaskUpdateConfiguration,
) -> Result<()> {
    let old_json = shard
        .old_config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| crate::error::SchedulerError::invariant(format!("cannot serialize old config: {e}")))?;
    let new_json = shard
        .new_config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| crate::error::SchedulerError::invariant(format!("cannot serialize new config: {e}")))?;
    sqlx::query(
        "INSERT OR REPLACE INTO task_update_configs (role, job_name, shard_id, old_config_json, new_config_json) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(role)
    .bind(job_name)
    .bind(shard.shard_id as i64)
    .bind(old_json)
    .bind(new_json)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn remove_shard_update_config(
    conn: &mut SqliteConnection,
    role: &str,
    job_name: &str,
    shard_id: u32,
) -> Result<()> {
    sqlx::query("DELETE FROM task_update_configs WHERE role = ? AND job_name = ? AND shard_id = ?")
        .bind(role)
        .bind(job_name)
        .bind(shard_id as i64)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn remove_job_update_config(conn: &mut SqliteConnection, role: &str, job_name: &str) -> Result<()> {
    sqlx::query("DELETE FROM task_update_configs WHERE role = ? AND job_name = ?")
        .bind(role)
        .bind(job_name)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM job_update_configs WHERE role = ? AND job_name = ?")
        .bind(role)
        .bind(job_name)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fetch_job_update_config(
    conn: &mut SqliteConnection,
    role: &str,
    job_name: &str,
) -> Result<Option<JobUpdateConfiguration>> {
    let header: Option<(String,)> =
        sqlx::query_as("SELECT update_token FROM job_update_configs WHERE role = ? AND job_name = ?")
            .bind(role)
            .bind(job_name)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((update_token,)) = header else {
        return Ok(None);
    };

    let rows: Vec<TaskUpdateConfigRow> = sqlx::query_as(
        "SELECT shard_id, old_config_json, new_config_json FROM task_update_configs \
         WHERE role = ? AND job_name = ? ORDER BY shard_id",
    )
    .bind(role)
    .bind(job_name)
    .fetch_all(conn)
    .await?;
    let shards = rows.into_iter().map(TaskUpdateConfiguration::try_from).collect::<Result<Vec<_>>>()?;

    Ok(Some(JobUpdateConfiguration { role: role.to_string(), job_name: job_name.to_string(), update_token, shards }))
}

/// All (role, job_name) pairs with a currently registered update — used by
/// the state manager to decide whether a late-arriving status update should
/// be routed through the rolling-update path.
pub async fn fetch_updating_jobs(conn: &mut SqliteConnection) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT role, job_name FROM job_update_configs").fetch_all(conn).await?;
    Ok(rows)
}
