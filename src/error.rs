//! Error taxonomy for the scheduler core.
//!
//! Every fallible entry point returns [`SchedulerError`]. Variants map
//! directly onto the RPC-facing status codes an outer (non-goal) RPC layer
//! would surface: [`SchedulerError::Update`] and [`SchedulerError::Schedule`]
//! are client errors, [`SchedulerError::Storage`] aborts the enclosing
//! transaction, and [`SchedulerError::Invariant`] is not expected to be
//! caught — it signals a bug.

use thiserror::Error;

/// Errors raised by the task state manager and update coordinator.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A rolling-update precondition was violated (bad token, concurrent
    /// update, unrecognized shards, no active tasks, tasks still updating).
    #[error("update error: {message}")]
    Update { message: String },

    /// A placement or job-lifecycle policy violation.
    #[error("schedule error: {message}")]
    Schedule { message: String },

    /// The underlying store failed. The enclosing transaction is aborted;
    /// no side effects escape.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// An internal invariant was violated (e.g. more than one task matched
    /// a query that the caller guaranteed was unique). Not meant to be
    /// handled — the process should not continue past this.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl SchedulerError {
    pub fn update(message: impl Into<String>) -> Self {
        Self::Update { message: message.into() }
    }

    pub fn schedule(message: impl Into<String>) -> Self {
        Self::Schedule { message: message.into() }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
