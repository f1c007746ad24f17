//! Task state manager and rolling-update coordinator for a cluster job
//! scheduler built atop an external resource-offer framework.
//!
//! This crate owns the hard part of that scheduler: a transactional task
//! store with a deferred side-effect queue ([`model::work`]), a per-task
//! status state machine ([`state_machine`]) driven by framework events and
//! administrative actions, the orchestration that ties transactions to that
//! machine ([`state_manager`]), and a rolling-update coordinator
//! ([`update_coordinator`]) built on top of both. The RPC surface, quota
//! enforcement, and backup/recovery that wrap this in a full scheduler are
//! out of scope — see `schedulerctl` for a minimal debugging client instead.

pub mod clock;
pub mod config;
pub mod constraints;
pub mod driver;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod state_machine;
pub mod state_manager;
pub mod store;
pub mod update_coordinator;

pub use clock::{Clock, SystemClock};
pub use config::SchedulerConfig;
pub use driver::Driver;
pub use error::{Result, SchedulerError};
pub use events::{Event, EventSink};
pub use state_manager::StateManager;
pub use store::Storage;
pub use update_coordinator::UpdateCoordinator;
