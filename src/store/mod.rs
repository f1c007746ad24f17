//! Transactional storage.
//!
//! [`Storage`] owns a SQLite connection pool and hands out real
//! `sqlx::Transaction`s. It intentionally does *not* know about the work
//! queue or event buffer described in the spec — those are owned by the
//! caller (`state_manager::StateManager`) that drains the queue against the
//! still-open transaction before committing. This mirrors the teacher
//! crate's `StateRuntime`: a thin pool wrapper, with all query logic living
//! in sibling modules that take an executor.

pub mod attribute_store;
pub mod task_store;
pub mod update_store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// A connection pool plus schema migration, mirroring the teacher's
/// `StateRuntime::init`.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Open (creating and migrating if necessary) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(options).await
    }

    /// Open a private in-memory database. Useful for tests and the CLI's
    /// `--scratch` mode; each call returns an independent database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect_single(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool: Arc::new(pool) })
    }

    /// In-memory SQLite only preserves state on a single connection, so the
    /// pool is pinned to one connection for this mode.
    async fn connect_single(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Begin a new write transaction. Callers are responsible for committing
    /// or rolling back and for draining any deferred work before commit.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Acquire a pooled connection for a read-only query. Read transactions
    /// may run concurrently with writes: SQLite's WAL mode gives readers a
    /// consistent snapshot without blocking the writer.
    pub async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }
}
