//! Multisig proposal tracker
//!
//! Privileged on-chain actions wait here until enough signers approve them.
//! Execution is an explicit call, never triggered by the last signature; the
//! on-chain result arrives through a `multisig_execution` polling task.

use crate::collaborators::{ChainClient, ContractCall, TxStatus};
use crate::config::MultisigConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{
    ExecutionReport, MultisigExecution, MultisigProposal, MultisigRejection, MultisigSignature,
    NewProposal, PollingRequest, PollingTask,
};
use crate::polling::PollingQueue;
use crate::status::{ProposalStatus, TaskType};
use crate::store::{ProposalStats, Store};

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct MultisigTracker {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    queue: Arc<PollingQueue>,
    config: MultisigConfig,
    /// Multisig contract per chain
    multisig_addresses: HashMap<u64, String>,
    /// Recorded as the executor of on-chain attempts
    executor: String,
    shutdown: Arc<RwLock<bool>>,
}

impl MultisigTracker {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        queue: Arc<PollingQueue>,
        config: MultisigConfig,
        multisig_addresses: HashMap<u64, String>,
        executor: impl Into<String>,
    ) -> Self {
        Self {
            store,
            chain,
            queue,
            config,
            multisig_addresses,
            executor: executor.into(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn create_proposal(&self, input: NewProposal) -> OrchestratorResult<MultisigProposal> {
        let required = input
            .required_signatures
            .unwrap_or(self.config.default_required_signatures);
        if required == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "required_signatures must be at least 1".to_string(),
            ));
        }
        let ttl = input.ttl_secs.unwrap_or(self.config.default_ttl_secs);
        if ttl <= 0 {
            return Err(OrchestratorError::InvalidArgument(format!(
                "ttl_secs must be positive, got {}",
                ttl
            )));
        }
        let multisig_address = self
            .multisig_addresses
            .get(&input.chain_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::InvalidArgument(format!(
                    "no multisig contract configured for chain {}",
                    input.chain_id
                ))
            })?;

        let now = Utc::now();
        let proposal = MultisigProposal {
            id: Uuid::new_v4(),
            chain_id: input.chain_id,
            action_type: input.action_type,
            request_id: input.request_id,
            source_tx_hash: input.source_tx_hash,
            multisig_address,
            target_contract: input.target_contract,
            value: input.value,
            call_data: input.call_data,
            description: input.description,
            status: ProposalStatus::Pending,
            proposer: input.proposer,
            signature_count: 0,
            required_signatures: required,
            rejection_count: 0,
            rejection_threshold: self.config.rejection_threshold.unwrap_or(required),
            created_at: now,
            deadline: now + Duration::seconds(ttl),
            executed_at: None,
            expired_at: None,
            execute_tx_hash: None,
            execute_block: None,
            execute_success: None,
            return_data: None,
            error_reason: None,
            version: 0,
            updated_at: now,
        };

        self.store.insert_proposal(&proposal).await?;
        crate::metrics::record_multisig_action("create");
        info!(
            proposal_id = %proposal.id,
            chain_id = proposal.chain_id,
            "Proposal created: {} ({} signatures required)",
            proposal.action_type,
            required
        );
        Ok(proposal)
    }

    pub async fn get_proposal(&self, id: Uuid) -> OrchestratorResult<MultisigProposal> {
        self.store
            .get_proposal(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("proposal", id))
    }

    /// Record one signer's approval. The count is recomputed from the stored
    /// signatures, so concurrent signers never overwrite each other.
    pub async fn sign(
        &self,
        proposal_id: Uuid,
        signer: &str,
        chain_id: u64,
        tx_hash: Option<String>,
    ) -> OrchestratorResult<MultisigProposal> {
        let proposal = self.get_proposal(proposal_id).await?;
        if chain_id != proposal.chain_id {
            return Err(OrchestratorError::InvalidArgument(format!(
                "proposal {} lives on chain {}, not {}",
                proposal_id, proposal.chain_id, chain_id
            )));
        }
        if proposal.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "proposal {} is {}",
                proposal_id, proposal.status
            )));
        }
        if proposal.is_past_deadline(Utc::now()) {
            if proposal.status == ProposalStatus::Executing {
                return Err(OrchestratorError::InvalidState(format!(
                    "proposal {} is executing past its deadline",
                    proposal_id
                )));
            }
            return Err(self.expire_now(proposal).await);
        }

        let signature = MultisigSignature {
            id: Uuid::new_v4(),
            proposal_id,
            signer: signer.to_lowercase(),
            chain_id,
            tx_hash,
            signed_at: Utc::now(),
        };
        let proposal = self.store.add_signature(&signature).await?;
        crate::metrics::record_multisig_action("sign");

        if proposal.has_quorum() && proposal.status == ProposalStatus::Pending {
            info!(
                proposal_id = %proposal_id,
                "Proposal reached {}/{} signatures and is eligible for execution",
                proposal.signature_count,
                proposal.required_signatures
            );
        } else {
            debug!(
                proposal_id = %proposal_id,
                "Signature from {} recorded ({}/{})",
                signature.signer,
                proposal.signature_count,
                proposal.required_signatures
            );
        }
        Ok(proposal)
    }

    pub async fn list_signatures(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigSignature>> {
        self.store.list_signatures(proposal_id).await
    }

    pub async fn list_executions(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigExecution>> {
        self.store.list_executions(proposal_id).await
    }

    /// Mark an overdue proposal expired and report why it cannot proceed
    async fn expire_now(&self, mut proposal: MultisigProposal) -> OrchestratorError {
        let id = proposal.id;
        proposal.status = ProposalStatus::Expired;
        proposal.expired_at = Some(Utc::now());
        if let Err(e) = self.store.update_proposal(&mut proposal).await {
            warn!(proposal_id = %id, "Could not mark proposal expired: {}", e);
        }
        OrchestratorError::InvalidState(format!("proposal {} expired at {}", id, proposal.deadline))
    }

    /// Submit an approved proposal on chain
    pub async fn execute(&self, proposal_id: Uuid) -> OrchestratorResult<MultisigProposal> {
        let mut proposal = self.get_proposal(proposal_id).await?;

        match proposal.status {
            ProposalStatus::Executed => {
                return Err(OrchestratorError::AlreadyExecuted(proposal_id.to_string()))
            }
            ProposalStatus::Rejected => {
                return Err(OrchestratorError::AlreadyRejected(proposal_id.to_string()))
            }
            ProposalStatus::Expired => {
                return Err(OrchestratorError::InvalidState(format!(
                    "proposal {} expired",
                    proposal_id
                )))
            }
            ProposalStatus::Executing => {
                return Err(OrchestratorError::InvalidState(format!(
                    "proposal {} is already executing",
                    proposal_id
                )))
            }
            ProposalStatus::ExecutionFailed => {
                return Err(OrchestratorError::InvalidState(format!(
                    "proposal {} failed execution; retry it first",
                    proposal_id
                )))
            }
            ProposalStatus::Pending => {}
        }
        if proposal.is_past_deadline(Utc::now()) {
            return Err(self.expire_now(proposal).await);
        }
        if !proposal.has_quorum() {
            return Err(OrchestratorError::InsufficientSignatures {
                have: proposal.signature_count,
                need: proposal.required_signatures,
            });
        }

        // Claim the execution before touching the chain
        proposal.status = ProposalStatus::Executing;
        proposal.error_reason = None;
        self.store.update_proposal(&mut proposal).await?;

        let call = ContractCall::ExecuteProposal {
            proposal_id,
            multisig: proposal.multisig_address.clone(),
            target: proposal.target_contract.clone(),
            value: proposal.value,
            call_data: proposal.call_data.clone(),
        };
        let tx_hash = match self.chain.submit(proposal.chain_id, call).await {
            Ok(hash) => hash,
            Err(e) => {
                error!(proposal_id = %proposal_id, "Proposal submission failed: {}", e);
                proposal.status = ProposalStatus::ExecutionFailed;
                proposal.error_reason = Some(e.to_string());
                self.store.update_proposal(&mut proposal).await?;
                return Err(e);
            }
        };

        proposal.execute_tx_hash = Some(tx_hash.clone());
        self.store.update_proposal(&mut proposal).await?;
        crate::metrics::record_multisig_action("execute");

        let request = PollingRequest::new(
            TaskType::MultisigExecution,
            proposal_id,
            proposal.chain_id,
            tx_hash.clone(),
            ProposalStatus::Executing,
            ProposalStatus::Executed,
        );
        match self.queue.enqueue(request).await {
            Ok(_) | Err(OrchestratorError::AlreadyActive { .. }) => {}
            Err(e) => {
                // Nothing would ever report on this transaction; let an operator retry it
                error!(proposal_id = %proposal_id, "Execution polling not scheduled: {}", e);
                proposal.status = ProposalStatus::ExecutionFailed;
                proposal.error_reason = Some(format!("execution tracking failed: {}", e));
                self.store.update_proposal(&mut proposal).await?;
                return Err(e);
            }
        }

        info!(proposal_id = %proposal_id, tx_hash = %tx_hash, "Proposal submitted for execution");
        Ok(proposal)
    }

    /// Apply the result of an on-chain attempt. Repeating a report for the
    /// same transaction changes nothing.
    pub async fn record_execution(
        &self,
        proposal_id: Uuid,
        report: ExecutionReport,
    ) -> OrchestratorResult<MultisigProposal> {
        let proposal = self.get_proposal(proposal_id).await?;
        let fresh = MultisigExecution::from_report(proposal_id, &report);
        let execution = if self.store.insert_execution(&fresh).await? {
            fresh
        } else {
            // The row may have landed without the proposal update that follows it
            let in_flight = proposal.status == ProposalStatus::Executing
                && proposal.execute_tx_hash.as_deref() == Some(report.tx_hash.as_str());
            if !in_flight {
                debug!(proposal_id = %proposal_id, tx_hash = %report.tx_hash, "Execution already recorded");
                return Ok(proposal);
            }
            let stored = self
                .store
                .list_executions(proposal_id)
                .await?
                .into_iter()
                .find(|e| e.execute_tx_hash == report.tx_hash);
            warn!(
                proposal_id = %proposal_id,
                tx_hash = %report.tx_hash,
                "Execution recorded but proposal still executing, applying it again"
            );
            stored.unwrap_or(fresh)
        };

        let mut attempt = 0;
        let mut proposal = proposal;
        loop {
            if proposal.status == ProposalStatus::Executed {
                return Ok(proposal);
            }
            proposal.execute_tx_hash = Some(execution.execute_tx_hash.clone());
            proposal.execute_block = execution.block_number;
            proposal.execute_success = Some(execution.success);
            proposal.return_data = execution.return_data.clone();

            // A revert is never an execution; the proposal stays retryable
            if execution.success {
                proposal.status = ProposalStatus::Executed;
                proposal.executed_at = Some(Utc::now());
                proposal.error_reason = None;
            } else {
                proposal.status = ProposalStatus::ExecutionFailed;
                proposal.error_reason = execution
                    .error_reason
                    .clone()
                    .or_else(|| Some("execution reverted".to_string()));
            }

            match self.store.update_proposal(&mut proposal).await {
                Ok(()) => break,
                Err(e) if e.is_concurrent_modification() && attempt == 0 => {
                    attempt += 1;
                    proposal = self.get_proposal(proposal_id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let action = if execution.success { "executed" } else { "execution_failed" };
        crate::metrics::record_multisig_action(action);
        info!(
            proposal_id = %proposal_id,
            tx_hash = %report.tx_hash,
            "Proposal execution recorded: {}",
            action
        );
        Ok(proposal)
    }

    /// Confirmation from the `multisig_execution` polling task
    pub async fn confirm_execution(&self, task: &PollingTask, status: &TxStatus) -> OrchestratorResult<()> {
        let report = ExecutionReport {
            executor: self.executor.clone(),
            tx_hash: task.tx_hash.clone(),
            block_number: status.block_number,
            gas_used: status.gas_used,
            success: true,
            return_data: None,
            error_reason: None,
        };
        self.record_execution(task.entity_id, report).await.map(|_| ())
    }

    /// Revert or timeout from the `multisig_execution` polling task
    pub async fn fail_execution(&self, task: &PollingTask, reason: &str) -> OrchestratorResult<()> {
        let report = ExecutionReport {
            executor: self.executor.clone(),
            tx_hash: task.tx_hash.clone(),
            block_number: None,
            gas_used: None,
            success: false,
            return_data: None,
            error_reason: Some(reason.to_string()),
        };
        self.record_execution(task.entity_id, report).await.map(|_| ())
    }

    /// Record a rejection. Reaching the proposal's rejection threshold makes
    /// the rejection terminal.
    pub async fn reject(
        &self,
        proposal_id: Uuid,
        signer: &str,
        reason: Option<String>,
    ) -> OrchestratorResult<MultisigProposal> {
        let proposal = self.get_proposal(proposal_id).await?;
        match proposal.status {
            ProposalStatus::Executed => {
                return Err(OrchestratorError::AlreadyExecuted(proposal_id.to_string()))
            }
            ProposalStatus::Rejected => {
                return Err(OrchestratorError::AlreadyRejected(proposal_id.to_string()))
            }
            ProposalStatus::Expired | ProposalStatus::Executing => {
                return Err(OrchestratorError::InvalidState(format!(
                    "proposal {} is {}",
                    proposal_id, proposal.status
                )))
            }
            ProposalStatus::Pending | ProposalStatus::ExecutionFailed => {}
        }

        let rejection = MultisigRejection {
            proposal_id,
            signer: signer.to_lowercase(),
            reason,
            rejected_at: Utc::now(),
        };
        let mut proposal = self.store.add_rejection(&rejection).await?;
        crate::metrics::record_multisig_action("reject");

        let mut attempt = 0;
        while proposal.rejection_count >= proposal.rejection_threshold
            && matches!(
                proposal.status,
                ProposalStatus::Pending | ProposalStatus::ExecutionFailed
            )
        {
            proposal.status = ProposalStatus::Rejected;
            match self.store.update_proposal(&mut proposal).await {
                Ok(()) => {
                    info!(
                        proposal_id = %proposal_id,
                        "Proposal rejected ({}/{} rejections)",
                        proposal.rejection_count,
                        proposal.rejection_threshold
                    );
                    break;
                }
                Err(e) if e.is_concurrent_modification() && attempt == 0 => {
                    attempt += 1;
                    proposal = self.get_proposal(proposal_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(proposal)
    }

    /// Put a proposal whose execution failed back up for execution
    pub async fn retry_proposal(&self, proposal_id: Uuid) -> OrchestratorResult<MultisigProposal> {
        let mut proposal = self.get_proposal(proposal_id).await?;
        if proposal.status != ProposalStatus::ExecutionFailed {
            return Err(OrchestratorError::InvalidState(format!(
                "proposal {} is {}, only execution_failed proposals can be retried",
                proposal_id, proposal.status
            )));
        }
        if proposal.is_past_deadline(Utc::now()) {
            return Err(self.expire_now(proposal).await);
        }

        proposal.status = ProposalStatus::Pending;
        proposal.error_reason = None;
        proposal.execute_tx_hash = None;
        proposal.execute_success = None;
        self.store.update_proposal(&mut proposal).await?;
        crate::metrics::record_multisig_action("retry");
        Ok(proposal)
    }

    /// Expire every pending proposal past its deadline
    pub async fn expire_overdue(&self) -> OrchestratorResult<Vec<Uuid>> {
        let expired = self.store.expire_overdue_proposals(Utc::now()).await?;
        if !expired.is_empty() {
            crate::metrics::record_proposals_expired(expired.len());
            for id in &expired {
                info!(proposal_id = %id, "Proposal expired");
            }
        }
        Ok(expired)
    }

    /// Expiry sweep loop
    pub async fn run(&self) -> OrchestratorResult<()> {
        let mut sweep_interval =
            interval(std::time::Duration::from_secs(self.config.sweep_interval_secs));
        info!(
            "Multisig expiry sweep started (every {}s)",
            self.config.sweep_interval_secs
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            sweep_interval.tick().await;
            if let Err(e) = self.expire_overdue().await {
                error!("Proposal expiry sweep failed: {}", e);
            }
        }

        info!("Multisig expiry sweep stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    pub async fn system_status(&self) -> OrchestratorResult<ProposalStats> {
        self.store.proposal_stats().await
    }
}
