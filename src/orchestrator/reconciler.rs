use super::Orchestrator;
use crate::collaborators::TxStatus;
use crate::error::OrchestratorResult;
use crate::models::PollingTask;
use crate::multisig::MultisigTracker;
use crate::polling::TaskHandler;
use crate::status::{RequestStatus, TaskType};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Routes polling results to the checkbook, withdraw and multisig flows
pub struct EntityReconciler {
    orchestrator: Arc<Orchestrator>,
    multisig: Option<Arc<MultisigTracker>>,
}

impl EntityReconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, multisig: Option<Arc<MultisigTracker>>) -> Self {
        Self {
            orchestrator,
            multisig,
        }
    }

    fn tracker(&self, task: &PollingTask) -> Option<&Arc<MultisigTracker>> {
        if self.multisig.is_none() {
            warn!(task_id = %task.id, "Multisig task polled without a tracker");
        }
        self.multisig.as_ref()
    }

    /// Current status of the stage a task watches, `None` when the entity is gone
    async fn stage_status(&self, task: &PollingTask) -> OrchestratorResult<Option<String>> {
        let store = &self.orchestrator.store;
        let status = match task.task_type {
            TaskType::CommitmentConfirmation => store
                .get_checkbook(task.entity_id)
                .await?
                .map(|c| c.status.to_string()),
            TaskType::WithdrawExecute | TaskType::WithdrawPayout | TaskType::WithdrawHook => {
                match store.get_withdraw_request(task.entity_id).await? {
                    Some(r) if r.status == RequestStatus::Cancelled => None,
                    Some(r) => Some(match task.task_type {
                        TaskType::WithdrawExecute => r.execute_status.to_string(),
                        TaskType::WithdrawPayout => r.payout_status.to_string(),
                        _ => r.hook_status.to_string(),
                    }),
                    None => None,
                }
            }
            TaskType::MultisigExecution => match self.tracker(task) {
                Some(_) => store
                    .get_proposal(task.entity_id)
                    .await?
                    .map(|p| p.status.to_string()),
                None => None,
            },
        };
        Ok(status)
    }
}

#[async_trait]
impl TaskHandler for EntityReconciler {
    async fn still_relevant(&self, task: &PollingTask) -> OrchestratorResult<bool> {
        Ok(self
            .stage_status(task)
            .await?
            .map_or(false, |status| status == task.current_status))
    }

    async fn on_confirmed(&self, task: &PollingTask, status: &TxStatus) -> OrchestratorResult<()> {
        match task.task_type {
            TaskType::CommitmentConfirmation => self.orchestrator.confirm_commitment(task, status).await,
            TaskType::WithdrawExecute => self.orchestrator.confirm_execute(task, status).await,
            TaskType::WithdrawPayout => self.orchestrator.confirm_payout(task, status).await,
            TaskType::WithdrawHook => self.orchestrator.confirm_hook(task, status).await,
            TaskType::MultisigExecution => match self.tracker(task) {
                Some(tracker) => tracker.confirm_execution(task, status).await,
                None => Ok(()),
            },
        }
    }

    async fn on_failed(&self, task: &PollingTask, reason: &str) -> OrchestratorResult<()> {
        match task.task_type {
            TaskType::CommitmentConfirmation => self.orchestrator.fail_commitment(task, reason).await,
            TaskType::WithdrawExecute => self.orchestrator.fail_execute(task, reason).await,
            TaskType::WithdrawPayout => self.orchestrator.fail_payout(task, reason).await,
            TaskType::WithdrawHook => self.orchestrator.fail_hook(task, reason).await,
            TaskType::MultisigExecution => match self.tracker(task) {
                Some(tracker) => tracker.fail_execution(task, reason).await,
                None => Ok(()),
            },
        }
    }
}
