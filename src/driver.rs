//! The driver collaborator: the resource-offer framework's task-kill
//! surface. A real deployment wires this to the actual framework driver; the
//! scheduler core only ever asks it to kill, never to launch (launching is
//! driven by the offer-matching loop this crate doesn't own).

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Request that the framework kill `task_id`. Fire-and-forget: the
    /// actual termination is observed later as a status update, not as the
    /// return value of this call.
    async fn kill_task(&self, task_id: &str) -> Result<()>;
}

/// A driver double that records every kill request instead of issuing one.
/// Grounded on the teacher's fake-provider test doubles: cheap to construct,
/// asserts against call order.
#[derive(Default)]
pub struct RecordingDriver {
    killed: Mutex<Vec<String>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn killed_task_ids(&self) -> Vec<String> {
        self.killed.lock().await.clone()
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    async fn kill_task(&self, task_id: &str) -> Result<()> {
        self.killed.lock().await.push(task_id.to_string());
        Ok(())
    }
}

/// A driver that only logs kill requests. Used by `schedulerctl`, where
/// there is no real framework connection to issue them against.
pub struct LoggingDriver;

#[async_trait]
impl Driver for LoggingDriver {
    async fn kill_task(&self, task_id: &str) -> Result<()> {
        tracing::info!(task_id, "driver kill_task (no framework connection, logged only)");
        Ok(())
    }
}
