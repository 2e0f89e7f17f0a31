//! Checkbook stages: signature, proof, commitment submission, confirmation

use super::Orchestrator;
use crate::collaborators::{ContractCall, ProofRequest, TxStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{Allocation, Checkbook, PollingRequest, PollingTask};
use crate::status::{AllocationStatus, CheckbookStatus, EntityType, TaskType};

use chrono::Utc;
use ethers::types::U256;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sequence numbers are a single byte
const MAX_ALLOCATIONS: usize = 256;

impl Orchestrator {
    /// Record a confirmed deposit as a new checkbook
    pub async fn create_checkbook(
        &self,
        owner: &str,
        chain_id: u64,
        amount: U256,
    ) -> OrchestratorResult<Checkbook> {
        if amount.is_zero() {
            return Err(OrchestratorError::InvalidArgument(
                "deposit amount must be positive".to_string(),
            ));
        }

        let checkbook = Checkbook::new(owner.to_lowercase(), chain_id, amount);
        self.store.insert_checkbook(&checkbook).await?;
        info!(checkbook_id = %checkbook.id, chain_id, "Checkbook created for {}", checkbook.owner);
        self.notify_checkbook(&checkbook);
        Ok(checkbook)
    }

    /// The deposit is waiting for the owner's signature
    pub async fn mark_unsigned(&self, id: Uuid) -> OrchestratorResult<Checkbook> {
        let mut checkbook = self.get_checkbook(id).await?;
        checkbook.transition(CheckbookStatus::Unsigned)?;
        self.save_checkbook(&mut checkbook).await?;
        self.notify_checkbook(&checkbook);
        Ok(checkbook)
    }

    /// Store the owner's signature and split the deposit into allocations
    pub async fn submit_signature(
        &self,
        id: Uuid,
        signature: &str,
        amounts: &[U256],
    ) -> OrchestratorResult<Vec<Allocation>> {
        if signature.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument("signature is empty".to_string()));
        }
        if amounts.is_empty() || amounts.len() > MAX_ALLOCATIONS {
            return Err(OrchestratorError::InvalidArgument(format!(
                "a checkbook holds between 1 and {} allocations, got {}",
                MAX_ALLOCATIONS,
                amounts.len()
            )));
        }
        if amounts.iter().any(|a| a.is_zero()) {
            return Err(OrchestratorError::InvalidArgument(
                "allocation amounts must be positive".to_string(),
            ));
        }

        let mut checkbook = self.get_checkbook(id).await?;
        let total = amounts
            .iter()
            .try_fold(U256::zero(), |sum, a| sum.checked_add(*a))
            .ok_or_else(|| OrchestratorError::InvalidArgument("allocation total overflows".to_string()))?;
        if total > checkbook.amount {
            return Err(OrchestratorError::InvalidArgument(format!(
                "allocations total {} exceeds deposit {}",
                total, checkbook.amount
            )));
        }

        checkbook.transition(CheckbookStatus::ReadyForCommitment)?;
        checkbook.signature = Some(signature.to_string());

        let allocations: Vec<Allocation> = amounts
            .iter()
            .enumerate()
            .map(|(seq, amount)| Allocation::new(id, seq as u8, *amount))
            .collect();
        self.store.sign_checkbook(&mut checkbook, &allocations).await?;
        crate::metrics::record_stage_transition("checkbook", checkbook.status.as_str());

        info!(
            checkbook_id = %id,
            "Signature stored, {} allocations created",
            allocations.len()
        );
        self.notify_checkbook(&checkbook);
        Ok(allocations)
    }

    /// Generate the commitment proof and put the commitment on chain
    pub async fn generate_and_submit_commitment(&self, id: Uuid) -> OrchestratorResult<Checkbook> {
        let mut checkbook = self.get_checkbook(id).await?;
        if checkbook.status != CheckbookStatus::ReadyForCommitment {
            return Err(OrchestratorError::InvalidState(format!(
                "checkbook {} is {}, expected ready_for_commitment",
                id, checkbook.status
            )));
        }
        checkbook.transition(CheckbookStatus::GeneratingProof)?;
        self.save_checkbook(&mut checkbook).await?;
        self.run_commitment_proof(checkbook).await
    }

    /// Re-enter proof generation after a failure. The stored signature is reused.
    pub async fn retry_proof_generation(&self, id: Uuid) -> OrchestratorResult<Checkbook> {
        let mut checkbook = self.get_checkbook(id).await?;
        if !checkbook.status.is_failure() {
            return Err(OrchestratorError::InvalidState(format!(
                "checkbook {} is {}, only failed checkbooks can retry",
                id, checkbook.status
            )));
        }
        checkbook.transition(CheckbookStatus::GeneratingProof)?;
        checkbook.last_error = None;
        self.save_checkbook(&mut checkbook).await?;
        self.run_commitment_proof(checkbook).await
    }

    /// Resubmit an already proven commitment
    pub async fn retry_commitment_submission(&self, id: Uuid) -> OrchestratorResult<Checkbook> {
        let mut checkbook = self.get_checkbook(id).await?;
        if checkbook.status != CheckbookStatus::SubmissionFailed {
            return Err(OrchestratorError::InvalidState(format!(
                "checkbook {} is {}, expected submission_failed",
                id, checkbook.status
            )));
        }
        if checkbook.proof.is_none() || checkbook.commitment.is_none() {
            return Err(OrchestratorError::InvalidState(format!(
                "checkbook {} has no proof to resubmit; regenerate it",
                id
            )));
        }
        checkbook.transition(CheckbookStatus::SubmittingCommitment)?;
        checkbook.last_error = None;
        self.save_checkbook(&mut checkbook).await?;
        self.run_commitment_submission(checkbook).await
    }

    /// Discard proof and commitment and prove again from scratch
    pub async fn restart_checkbook(&self, id: Uuid) -> OrchestratorResult<Checkbook> {
        let mut checkbook = self.get_checkbook(id).await?;
        match checkbook.status {
            CheckbookStatus::WithCheckbook => {
                return Err(OrchestratorError::InvalidState(format!(
                    "checkbook {} is already committed",
                    id
                )))
            }
            CheckbookStatus::CommitmentPending => {
                return Err(OrchestratorError::InvalidState(format!(
                    "checkbook {} has a commitment transaction in flight",
                    id
                )))
            }
            CheckbookStatus::Pending | CheckbookStatus::Unsigned => {
                return Err(OrchestratorError::InvalidState(format!(
                    "checkbook {} has not been signed yet",
                    id
                )))
            }
            _ => {}
        }

        self.queue
            .cancel_tasks_for_entity(EntityType::Checkbook, id, "checkbook restarted")
            .await?;
        checkbook.clear_proof_artifacts();
        checkbook.last_error = None;
        // Forced restart ignores the transition table
        checkbook.status = CheckbookStatus::GeneratingProof;
        self.save_checkbook(&mut checkbook).await?;
        info!(checkbook_id = %id, "Checkbook restarted from proof generation");
        self.run_commitment_proof(checkbook).await
    }

    pub async fn get_allocation(&self, id: Uuid) -> OrchestratorResult<Allocation> {
        self.store
            .get_allocations(&[id])
            .await?
            .pop()
            .ok_or_else(|| OrchestratorError::not_found("allocation", id))
    }

    /// Idle allocations of a committed checkbook
    pub async fn available_allocations(&self, checkbook_id: Uuid) -> OrchestratorResult<Vec<Allocation>> {
        let checkbook = self.get_checkbook(checkbook_id).await?;
        if checkbook.status != CheckbookStatus::WithCheckbook {
            return Ok(Vec::new());
        }
        let allocations = self.store.list_allocations(checkbook_id).await?;
        Ok(allocations
            .into_iter()
            .filter(|a| a.status == AllocationStatus::Idle)
            .collect())
    }

    /// Proof stage; the checkbook is already saved as generating_proof
    async fn run_commitment_proof(&self, mut checkbook: Checkbook) -> OrchestratorResult<Checkbook> {
        let request = ProofRequest {
            entity_type: EntityType::Checkbook,
            entity_id: checkbook.id,
            owner: checkbook.owner.clone(),
            chain_id: checkbook.chain_id,
            amount: checkbook.amount,
            signature: checkbook.signature.clone(),
            allocation_ids: Vec::new(),
            beneficiary: None,
        };

        let sealed = match self.proofs.generate_proof(request).await {
            Ok(output) => match output.commitment {
                Some(commitment) => checkbook.seal_commitment(&commitment).map(|_| output.proof),
                None => Err(OrchestratorError::external(
                    "proof generator",
                    "proof output carries no commitment",
                )),
            },
            Err(e) => Err(e),
        };

        let proof = match sealed {
            Ok(proof) => proof,
            Err(e) => {
                error!(checkbook_id = %checkbook.id, "Commitment proof failed: {}", e);
                checkbook.fail(CheckbookStatus::ProofFailed, e.to_string())?;
                self.save_checkbook(&mut checkbook).await?;
                self.notify_checkbook(&checkbook);
                return Err(e);
            }
        };

        checkbook.proof = Some(proof);
        checkbook.proved_at = Some(Utc::now());
        checkbook.transition(CheckbookStatus::SubmittingCommitment)?;
        self.save_checkbook(&mut checkbook).await?;
        self.run_commitment_submission(checkbook).await
    }

    /// Submission stage; the checkbook is already saved as submitting_commitment
    async fn run_commitment_submission(&self, mut checkbook: Checkbook) -> OrchestratorResult<Checkbook> {
        let (Some(commitment), Some(proof)) = (checkbook.commitment.clone(), checkbook.proof.clone()) else {
            return Err(OrchestratorError::InvalidState(format!(
                "checkbook {} reached submission without a proof",
                checkbook.id
            )));
        };

        let call = ContractCall::SubmitCommitment {
            checkbook_id: checkbook.id,
            commitment,
            proof,
        };
        let tx_hash = match self.chain.submit(checkbook.chain_id, call).await {
            Ok(hash) => hash,
            Err(e) => {
                error!(checkbook_id = %checkbook.id, "Commitment submission failed: {}", e);
                checkbook.fail(CheckbookStatus::SubmissionFailed, e.to_string())?;
                self.save_checkbook(&mut checkbook).await?;
                self.notify_checkbook(&checkbook);
                return Err(e);
            }
        };

        checkbook.commitment_tx_hash = Some(tx_hash.clone());
        checkbook.transition(CheckbookStatus::CommitmentPending)?;
        self.save_checkbook(&mut checkbook).await?;

        self.track(PollingRequest::new(
            TaskType::CommitmentConfirmation,
            checkbook.id,
            checkbook.chain_id,
            tx_hash.clone(),
            CheckbookStatus::CommitmentPending,
            CheckbookStatus::WithCheckbook,
        ))
        .await?;

        info!(checkbook_id = %checkbook.id, tx_hash = %tx_hash, "Commitment submitted");
        self.notify_checkbook(&checkbook);
        Ok(checkbook)
    }

    /// Commitment transaction confirmed on chain
    pub(crate) async fn confirm_commitment(&self, task: &PollingTask, status: &TxStatus) -> OrchestratorResult<()> {
        let mut checkbook = self.get_checkbook(task.entity_id).await?;
        if checkbook.status == CheckbookStatus::WithCheckbook {
            return Ok(());
        }
        checkbook.commitment_block = status.block_number;
        checkbook.transition(CheckbookStatus::WithCheckbook)?;
        self.save_checkbook(&mut checkbook).await?;
        info!(checkbook_id = %checkbook.id, "Checkbook committed in block {:?}", status.block_number);
        self.notify_checkbook(&checkbook);
        Ok(())
    }

    /// Commitment reverted or never confirmed
    pub(crate) async fn fail_commitment(&self, task: &PollingTask, reason: &str) -> OrchestratorResult<()> {
        let mut checkbook = self.get_checkbook(task.entity_id).await?;
        if checkbook.status != CheckbookStatus::CommitmentPending {
            warn!(checkbook_id = %checkbook.id, "Ignoring commitment failure in status {}", checkbook.status);
            return Ok(());
        }
        checkbook.fail(CheckbookStatus::SubmissionFailed, reason)?;
        self.save_checkbook(&mut checkbook).await?;
        self.notify_checkbook(&checkbook);
        Ok(())
    }
}
