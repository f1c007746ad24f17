//! A local debugging client over `StateManager`/`Storage`, in the spirit of
//! the teacher crate's `logs_client`. This is explicitly not the thrift-style
//! admin RPC surface — it talks to the same SQLite database directly and is
//! meant for operators poking at a single scheduler instance's state.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use scheduler_core::clock::SystemClock;
use scheduler_core::config::SchedulerConfig;
use scheduler_core::driver::LoggingDriver;
use scheduler_core::events::LoggingEventSink;
use scheduler_core::model::{ScheduleStatus, TaskConfig, TaskQuery};
use scheduler_core::store::update_store;
use scheduler_core::{StateManager, Storage, UpdateCoordinator};

#[derive(Debug, Parser)]
#[command(name = "schedulerctl")]
#[command(about = "Inspect and poke at a scheduler-core SQLite database")]
struct Args {
    /// Path to the SQLite database. Created if missing.
    #[arg(long, default_value = "scheduler.sqlite")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List tasks, optionally filtered by role/job/status.
    Tasks {
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        job: Option<String>,
        #[arg(long, value_name = "STATUS")]
        status: Option<String>,
    },
    /// Show the registered rolling-update configuration for a job, if any.
    ShowUpdate {
        #[arg(long)]
        role: String,
        #[arg(long)]
        job: String,
    },
    /// Insert a brand-new task in INIT, driven immediately to PENDING.
    Insert {
        #[arg(long)]
        role: String,
        #[arg(long)]
        environment: String,
        #[arg(long)]
        job: String,
        #[arg(long)]
        shard: u32,
        #[arg(long, default_value_t = 1.0)]
        cpus: f64,
        #[arg(long, default_value_t = 256)]
        ram_mb: u64,
        #[arg(long, default_value_t = 512)]
        disk_mb: u64,
    },
    /// Drive every task matching role/job/shard to KILLING and wait for it
    /// to leave the active set.
    Kill {
        #[arg(long)]
        role: String,
        #[arg(long)]
        job: String,
        #[arg(long)]
        shard: Option<u32>,
    },
    /// Register, then immediately finish, a rolling update from the job's
    /// current shard configs to a bumped `ram_mb` — a quick way to exercise
    /// the update path without scripting a real config diff.
    BumpRam {
        #[arg(long)]
        role: String,
        #[arg(long)]
        job: String,
        #[arg(long)]
        ram_mb: u64,
        #[arg(long, default_value = "schedulerctl")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let storage = Storage::open(&args.db).await.with_context(|| format!("opening {}", args.db.display()))?;
    let state_manager = Arc::new(StateManager::new(
        storage,
        Arc::new(LoggingDriver),
        Arc::new(LoggingEventSink),
        Arc::new(SystemClock),
        SchedulerConfig::default(),
    ));

    match args.command {
        Command::Tasks { role, job, status } => tasks(&state_manager, role, job, status).await,
        Command::ShowUpdate { role, job } => show_update(&state_manager, &role, &job).await,
        Command::Insert { role, environment, job, shard, cpus, ram_mb, disk_mb } => {
            insert(&state_manager, role, environment, job, shard, cpus, ram_mb, disk_mb).await
        }
        Command::Kill { role, job, shard } => kill(&state_manager, role, job, shard).await,
        Command::BumpRam { role, job, ram_mb, user } => bump_ram(&state_manager, role, job, ram_mb, user).await,
    }
}

async fn tasks(state_manager: &Arc<StateManager>, role: Option<String>, job: Option<String>, status: Option<String>) -> anyhow::Result<()> {
    let mut query = TaskQuery::default();
    query.role = role;
    query.job_name = job;
    if let Some(status) = status {
        let parsed = ScheduleStatus::parse(&status.to_ascii_uppercase()).context("unrecognized --status")?;
        query.statuses = Some([parsed].into_iter().collect());
    }
    let tasks = state_manager.fetch_tasks(&query).await.context("fetching tasks")?;
    if tasks.is_empty() {
        println!("(no matching tasks)");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{}  {:<10} role={} job={} shard={} failures={} host={}",
            task.task_id,
            task.status,
            task.config.role,
            task.config.job_name,
            task.config.shard_id,
            task.failure_count,
            task.placement.slave_host.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn show_update(state_manager: &Arc<StateManager>, role: &str, job: &str) -> anyhow::Result<()> {
    let mut conn = state_manager.storage().acquire().await?;
    match update_store::fetch_job_update_config(&mut conn, role, job).await? {
        None => println!("no update registered for {role}/{job}"),
        Some(config) => {
            println!("token={}", config.update_token);
            for shard in &config.shards {
                println!(
                    "  shard {}: old={} new={}",
                    shard.shard_id,
                    shard.old_config.is_some(),
                    shard.new_config.is_some(),
                );
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert(
    state_manager: &Arc<StateManager>,
    role: String,
    environment: String,
    job: String,
    shard: u32,
    cpus: f64,
    ram_mb: u64,
    disk_mb: u64,
) -> anyhow::Result<()> {
    let config = TaskConfig {
        role,
        environment,
        job_name: job,
        shard_id: shard,
        requested_ports: Vec::new(),
        num_cpus: cpus,
        ram_mb,
        disk_mb,
        is_service: true,
        max_task_failures: 3,
        constraints: Vec::new(),
    };
    let ids = state_manager.insert_tasks(vec![config]).await.context("inserting task")?;
    for id in ids {
        println!("inserted {id}");
    }
    Ok(())
}

async fn kill(state_manager: &Arc<StateManager>, role: String, job: String, shard: Option<u32>) -> anyhow::Result<()> {
    let mut query = TaskQuery::for_job(role, job);
    if let Some(shard) = shard {
        query = query.with_shards(BTreeSet::from([shard]));
    }
    state_manager.kill_tasks(query, Some("killed via schedulerctl".to_string())).await.context("killing tasks")?;
    println!("done");
    Ok(())
}

async fn bump_ram(state_manager: &Arc<StateManager>, role: String, job: String, ram_mb: u64, user: String) -> anyhow::Result<()> {
    let active = state_manager.fetch_tasks(&TaskQuery::for_job(role.clone(), job.clone()).active_only()).await?;
    if active.is_empty() {
        anyhow::bail!("no active tasks for {role}/{job}");
    }
    let new_configs: Vec<TaskConfig> = active
        .iter()
        .map(|t| {
            let mut config = t.config.clone();
            config.ram_mb = ram_mb;
            config
        })
        .collect();

    let coordinator = UpdateCoordinator::new(state_manager.clone());
    let token = coordinator.register_update(&role, &job, new_configs).await.context("registering update")?;
    let shard_ids: BTreeSet<u32> = active.iter().map(|t| t.config.shard_id).collect();
    let result = coordinator.modify_shards(&role, &job, shard_ids, &token, true, &user).await.context("driving shards")?;
    for (shard_id, outcome) in &result {
        println!("shard {shard_id}: {outcome:?}");
    }
    println!("token={token} — call finish_update once the driven shards settle");
    Ok(())
}
