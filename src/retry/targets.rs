use super::{EntitySnapshot, RetryTarget};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::Orchestrator;
use crate::status::{CheckbookStatus, RequestStatus, RetryStep};

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

fn with_reason(message: &str, reason: Option<&String>) -> String {
    match reason {
        Some(reason) => format!("{} Reason: {}", message, reason),
        None => message.to_string(),
    }
}

/// Checkbook commitment flow
pub struct CheckbookRetry {
    orchestrator: Arc<Orchestrator>,
}

impl CheckbookRetry {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

fn checkbook_message(status: CheckbookStatus) -> &'static str {
    match status {
        CheckbookStatus::Pending => "Deposit received, preparing checkbook.",
        CheckbookStatus::Unsigned => "Waiting for your signature.",
        CheckbookStatus::ReadyForCommitment => "Signature received, commitment queued.",
        CheckbookStatus::GeneratingProof => "Generating commitment proof.",
        CheckbookStatus::SubmittingCommitment => "Submitting commitment on chain.",
        CheckbookStatus::CommitmentPending => "Waiting for the commitment to confirm.",
        CheckbookStatus::WithCheckbook => "Checkbook ready to spend.",
        CheckbookStatus::ProofFailed => "Commitment proof could not be generated.",
        CheckbookStatus::SubmissionFailed => "Commitment could not be submitted.",
    }
}

#[async_trait]
impl RetryTarget for CheckbookRetry {
    async fn snapshot(&self, id: Uuid) -> OrchestratorResult<EntitySnapshot> {
        let checkbook = self.orchestrator.get_checkbook(id).await?;
        let failed_step = match checkbook.status {
            CheckbookStatus::ProofFailed => Some(RetryStep::GeneratingProof),
            CheckbookStatus::SubmissionFailed => Some(RetryStep::SubmittingCommitment),
            _ => None,
        };
        let reason = checkbook.last_error.as_ref().filter(|_| checkbook.can_retry());
        Ok(EntitySnapshot {
            status: checkbook.status.to_string(),
            failed_step,
            first_step: RetryStep::GeneratingProof,
            can_retry: checkbook.can_retry(),
            user_message: with_reason(checkbook_message(checkbook.status), reason),
        })
    }

    async fn restart(&self, id: Uuid) -> OrchestratorResult<RetryStep> {
        self.orchestrator.restart_checkbook(id).await?;
        Ok(RetryStep::GeneratingProof)
    }

    async fn dispatch(&self, id: Uuid, step: RetryStep) -> OrchestratorResult<()> {
        match step {
            RetryStep::GeneratingProof => self.orchestrator.retry_proof_generation(id).await.map(|_| ()),
            RetryStep::SubmittingCommitment => {
                self.orchestrator.retry_commitment_submission(id).await.map(|_| ())
            }
            other => Err(OrchestratorError::InvalidArgument(format!(
                "{} is not a checkbook stage",
                other
            ))),
        }
    }
}

/// Withdraw request pipeline
pub struct WithdrawRetry {
    orchestrator: Arc<Orchestrator>,
}

impl WithdrawRetry {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

fn request_message(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Created => "Withdrawal created.",
        RequestStatus::Proving => "Generating withdrawal proof.",
        RequestStatus::ProofFailed => "Withdrawal proof could not be generated.",
        RequestStatus::ProofGenerated => "Proof ready, submitting withdrawal.",
        RequestStatus::Submitting => "Waiting for the withdrawal transaction to confirm.",
        RequestStatus::SubmitFailed => "Withdrawal transaction failed.",
        RequestStatus::WaitingForPayout => "Withdrawal confirmed, payout queued.",
        RequestStatus::PayoutProcessing => "Delivering funds.",
        RequestStatus::PayoutFailed => "Funds could not be delivered.",
        RequestStatus::HookProcessing => "Funds delivered, running the follow-up call.",
        RequestStatus::HookFailed => "Funds delivered, but the follow-up call failed.",
        RequestStatus::Completed => "Withdrawal completed.",
        RequestStatus::Cancelled => "Withdrawal cancelled.",
    }
}

#[async_trait]
impl RetryTarget for WithdrawRetry {
    async fn snapshot(&self, id: Uuid) -> OrchestratorResult<EntitySnapshot> {
        let request = self.orchestrator.get_withdraw_request(id).await?;
        let (failed_step, reason) = match request.status {
            RequestStatus::ProofFailed => (Some(RetryStep::Proof), request.proof_error.as_ref()),
            RequestStatus::SubmitFailed => (Some(RetryStep::Execute), request.execute_error.as_ref()),
            RequestStatus::PayoutFailed => (Some(RetryStep::Payout), request.payout_error.as_ref()),
            RequestStatus::HookFailed => (Some(RetryStep::Hook), request.hook_error.as_ref()),
            _ => (None, None),
        };
        Ok(EntitySnapshot {
            status: request.status.to_string(),
            failed_step,
            first_step: RetryStep::Proof,
            can_retry: request.status.is_failure(),
            user_message: with_reason(request_message(request.status), reason),
        })
    }

    async fn restart(&self, id: Uuid) -> OrchestratorResult<RetryStep> {
        self.orchestrator.restart_withdraw_request(id).await?;
        Ok(RetryStep::Proof)
    }

    async fn dispatch(&self, id: Uuid, step: RetryStep) -> OrchestratorResult<()> {
        self.orchestrator
            .retry_withdraw_stage(id, step)
            .await
            .map(|_| ())
    }
}

/// Individual allocations ("checks"). Status is readable; retry is not
/// available yet.
pub struct AllocationRetry {
    orchestrator: Arc<Orchestrator>,
}

impl AllocationRetry {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl RetryTarget for AllocationRetry {
    async fn snapshot(&self, id: Uuid) -> OrchestratorResult<EntitySnapshot> {
        let allocation = self.orchestrator.get_allocation(id).await?;
        Ok(EntitySnapshot {
            status: allocation.status.to_string(),
            failed_step: None,
            first_step: RetryStep::Proof,
            can_retry: false,
            user_message: format!("Allocation #{} is {}.", allocation.seq, allocation.status),
        })
    }

    async fn restart(&self, _id: Uuid) -> OrchestratorResult<RetryStep> {
        Err(OrchestratorError::NotImplemented("check retry".to_string()))
    }

    async fn dispatch(&self, _id: Uuid, _step: RetryStep) -> OrchestratorResult<()> {
        Err(OrchestratorError::NotImplemented("check retry".to_string()))
    }
}
