mod attribute;
mod task;
mod update;
mod work;

pub use attribute::{Attribute, Constraint};
pub use task::{AssignedPlacement, ScheduleStatus, ScheduledTask, TaskConfig, TaskEvent, TaskQuery};
pub use update::{
    ConfigSide, JobUpdateConfiguration, ShardUpdateResult, TaskUpdateConfiguration, UpdateOutcome,
};
pub use work::{TaskMutation, WorkCommand, WorkQueue};

pub(crate) use task::{task_from_row, TaskEventRow, TaskRow};
pub(crate) use update::TaskUpdateConfigRow;
