//! Polling reconciliation
//!
//! A durable queue of "poll the chain until X reaches Y" jobs. `PollingQueue`
//! owns task creation and administration; `PollingScheduler` claims due tasks
//! on a fixed cadence and evaluates each one on its own tokio task.

mod queue;
mod scheduler;

pub use queue::PollingQueue;
pub use scheduler::{PollingScheduler, TickSummary};

use crate::collaborators::TxStatus;
use crate::error::OrchestratorResult;
use crate::models::PollingTask;
use crate::status::{EntityType, TaskType};

use async_trait::async_trait;
use uuid::Uuid;

/// How a task ended, reported to the orchestrator so it can start the next stage
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Confirmed { block_number: Option<u64> },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollSignal {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub outcome: PollOutcome,
}

impl PollSignal {
    pub fn new(task: &PollingTask, outcome: PollOutcome) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            entity_type: task.entity_type,
            entity_id: task.entity_id,
            outcome,
        }
    }
}

/// Applies a polling result to the entity that owns the task
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Whether the owning entity is still in the status the task was created for
    async fn still_relevant(&self, task: &PollingTask) -> OrchestratorResult<bool>;

    /// The transaction reached the target status
    async fn on_confirmed(&self, task: &PollingTask, status: &TxStatus) -> OrchestratorResult<()>;

    /// The transaction failed on chain or never confirmed within the retry budget
    async fn on_failed(&self, task: &PollingTask, reason: &str) -> OrchestratorResult<()>;
}
