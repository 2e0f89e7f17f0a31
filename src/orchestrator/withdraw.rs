//! Withdraw request pipeline: proof, execute, payout, hook

use super::Orchestrator;
use crate::collaborators::{ContractCall, PayoutError, PayoutOrder, ProofRequest, TxStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{
    HookCalldata, PollingRequest, PollingTask, RouteConstraints, WithdrawRequest, WorkerType,
};
use crate::status::{
    AllocationStatus, CheckbookStatus, EntityType, ExecuteStatus, HookStatus, IntentType,
    PayoutStatus, ProofStatus, RequestStatus, RetryStep, TaskType,
};

use chrono::{Duration, Utc};
use ethers::types::U256;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BPS_DENOMINATOR: u32 = 10_000;

/// Input for a new withdraw request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWithdrawRequest {
    pub owner: String,
    pub beneficiary: String,
    pub intent_type: IntentType,
    pub token: String,
    pub allocation_ids: Vec<Uuid>,
    pub target_chain_id: u64,
    pub worker_type: WorkerType,
    #[serde(default)]
    pub worker_params: serde_json::Value,
    #[serde(default)]
    pub route: RouteConstraints,
    /// Hex ABI payload carried by the withdraw event
    #[serde(default)]
    pub hook_calldata: Option<String>,
}

/// Amount delivered to the beneficiary after the fee
fn payout_amount(request: &WithdrawRequest) -> U256 {
    let bps = request.fee_rate_bps.unwrap_or(0).min(BPS_DENOMINATOR);
    let fee = request.amount * U256::from(bps) / U256::from(BPS_DENOMINATOR);
    request.amount - fee
}

/// The stage to run next, if any is ready to start
fn next_step(request: &WithdrawRequest) -> Option<RetryStep> {
    if request.status == RequestStatus::Cancelled {
        return None;
    }
    match (
        request.proof_status,
        request.execute_status,
        request.payout_status,
        request.hook_status,
    ) {
        (ProofStatus::Pending, ..) => Some(RetryStep::Proof),
        (ProofStatus::Completed, ExecuteStatus::Pending, ..) => Some(RetryStep::Execute),
        (_, ExecuteStatus::Success, PayoutStatus::Pending, _) => Some(RetryStep::Payout),
        (_, ExecuteStatus::Success, PayoutStatus::Completed, HookStatus::Pending) => Some(RetryStep::Hook),
        _ => None,
    }
}

fn ensure_open(request: &WithdrawRequest) -> OrchestratorResult<()> {
    if request.status == RequestStatus::Cancelled {
        return Err(OrchestratorError::InvalidState(format!(
            "withdraw request {} is cancelled",
            request.id
        )));
    }
    Ok(())
}

impl Orchestrator {
    /// Validate the selected allocations, look up the fee and claim the
    /// allocations for a new request
    pub async fn create_withdraw_request(
        &self,
        input: CreateWithdrawRequest,
    ) -> OrchestratorResult<WithdrawRequest> {
        if input.allocation_ids.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "at least one allocation is required".to_string(),
            ));
        }
        let distinct: HashSet<_> = input.allocation_ids.iter().collect();
        if distinct.len() != input.allocation_ids.len() {
            return Err(OrchestratorError::InvalidArgument(
                "allocation ids must be distinct".to_string(),
            ));
        }
        if input.beneficiary.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument("beneficiary is empty".to_string()));
        }
        input.route.validate()?;

        let hook_calldata = match input.hook_calldata.as_deref().filter(|raw| !raw.is_empty()) {
            Some(raw) => {
                let bytes = hex::decode(raw.trim_start_matches("0x")).map_err(|e| {
                    OrchestratorError::InvalidArgument(format!("hook calldata is not hex: {}", e))
                })?;
                HookCalldata::decode(&bytes)?
            }
            None => None,
        };

        let allocations = self.store.get_allocations(&input.allocation_ids).await?;
        if let Some(missing) = input
            .allocation_ids
            .iter()
            .find(|id| !allocations.iter().any(|a| a.id == **id))
        {
            return Err(OrchestratorError::not_found("allocation", missing));
        }
        if let Some(busy) = allocations.iter().find(|a| a.status != AllocationStatus::Idle) {
            return Err(OrchestratorError::InvalidState(format!(
                "allocation {} is {}",
                busy.id, busy.status
            )));
        }

        let owner = input.owner.to_lowercase();
        let mut execute_chain_id = None;
        let checkbook_ids: BTreeSet<Uuid> = allocations.iter().map(|a| a.checkbook_id).collect();
        for checkbook_id in checkbook_ids {
            let checkbook = self.get_checkbook(checkbook_id).await?;
            if checkbook.status != CheckbookStatus::WithCheckbook {
                return Err(OrchestratorError::InvalidState(format!(
                    "checkbook {} is {}, not yet spendable",
                    checkbook_id, checkbook.status
                )));
            }
            if checkbook.owner != owner {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "checkbook {} does not belong to {}",
                    checkbook_id, owner
                )));
            }
            match execute_chain_id {
                Some(chain_id) if chain_id != checkbook.chain_id => {
                    return Err(OrchestratorError::InvalidArgument(
                        "allocations span more than one chain".to_string(),
                    ))
                }
                _ => execute_chain_id = Some(checkbook.chain_id),
            }
        }
        let execute_chain_id = execute_chain_id
            .ok_or_else(|| OrchestratorError::Internal("no checkbook behind allocations".to_string()))?;

        let amount = allocations
            .iter()
            .try_fold(U256::zero(), |sum, a| sum.checked_add(a.amount))
            .ok_or_else(|| OrchestratorError::InvalidArgument("withdraw amount overflows".to_string()))?;

        let fee_rate_bps = self
            .fees
            .fee_rate_bps(input.target_chain_id, &input.beneficiary, &input.token)
            .await?;
        if fee_rate_bps > BPS_DENOMINATOR {
            return Err(OrchestratorError::external(
                "fee oracle",
                format!("fee rate {} bps exceeds 100%", fee_rate_bps),
            ));
        }

        let mut request = WithdrawRequest::new(
            owner,
            input.beneficiary,
            input.intent_type,
            input.token,
            amount,
            input.allocation_ids,
            execute_chain_id,
            input.target_chain_id,
            input.worker_type,
            input.worker_params,
            input.route,
            hook_calldata,
        );
        request.fee_rate_bps = Some(fee_rate_bps);

        self.store
            .claim_allocations(&request.allocation_ids, request.id)
            .await?;
        if let Err(e) = self.store.insert_withdraw_request(&request).await {
            if let Err(release) = self.store.release_allocations(request.id).await {
                error!(request_id = %request.id, "Allocations left claimed after failed insert: {}", release);
            }
            return Err(e);
        }

        info!(
            request_id = %request.id,
            execute_chain_id,
            target_chain_id = request.target_chain_id,
            "Withdraw request created for {} allocations ({} wei, fee {} bps)",
            request.allocation_ids.len(),
            request.amount,
            fee_rate_bps
        );
        self.notify_request(&request);
        Ok(request)
    }

    /// Run every stage that is ready, stopping at the first hand-off to the chain
    pub async fn advance(&self, id: Uuid) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        while let Some(step) = next_step(&request) {
            debug!(request_id = %id, "Running stage {}", step);
            request = match step {
                RetryStep::Proof => self.generate_proof(id).await?,
                RetryStep::Execute => self.submit_execute(id).await?,
                RetryStep::Payout => self.process_payout(id).await?,
                RetryStep::Hook => self.process_hook(id).await?,
                other => {
                    return Err(OrchestratorError::Internal(format!(
                        "{} is not a withdraw stage",
                        other
                    )))
                }
            };
        }
        Ok(request)
    }

    /// Proof stage
    pub async fn generate_proof(&self, id: Uuid) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        ensure_open(&request)?;
        if !matches!(request.proof_status, ProofStatus::Pending | ProofStatus::Failed) {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} proof is {}",
                id, request.proof_status
            )));
        }

        request.proof_status = ProofStatus::InProgress;
        request.proof_error = None;
        self.save_request(&mut request, "proof").await?;

        let proof_request = ProofRequest {
            entity_type: EntityType::WithdrawRequest,
            entity_id: id,
            owner: request.owner.clone(),
            chain_id: request.execute_chain_id,
            amount: request.amount,
            signature: None,
            allocation_ids: request.allocation_ids.clone(),
            beneficiary: Some(request.beneficiary.clone()),
        };

        match self.proofs.generate_proof(proof_request).await {
            Ok(output) => {
                request.proof = Some(output.proof);
                request.public_values = Some(output.public_values);
                request.proof_generated_at = Some(Utc::now());
                request.proof_status = ProofStatus::Completed;
                self.save_request(&mut request, "proof").await?;
                info!(request_id = %id, "Withdrawal proof generated");
                Ok(request)
            }
            Err(e) => {
                error!(request_id = %id, "Withdrawal proof failed: {}", e);
                request.proof_status = ProofStatus::Failed;
                request.proof_error = Some(e.to_string());
                self.save_request(&mut request, "proof").await?;
                self.notify_request(&request);
                Err(e)
            }
        }
    }

    /// Execute stage: submit the proof to the settlement contract
    pub async fn submit_execute(&self, id: Uuid) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        ensure_open(&request)?;
        let (Some(proof), Some(public_values)) = (request.proof.clone(), request.public_values.clone()) else {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} has no proof",
                id
            )));
        };
        if request.proof_status != ProofStatus::Completed
            || !matches!(request.execute_status, ExecuteStatus::Pending | ExecuteStatus::Failed)
        {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} cannot execute (proof {}, execute {})",
                id, request.proof_status, request.execute_status
            )));
        }

        // Claim the stage before anything reaches the chain
        request.execute_status = ExecuteStatus::Submitted;
        request.execute_error = None;
        request.execute_tx_hash = None;
        self.save_request(&mut request, "execute").await?;

        let call = ContractCall::ExecuteWithdraw {
            request_id: id,
            proof,
            public_values,
        };
        let tx_hash = match self.chain.submit(request.execute_chain_id, call).await {
            Ok(hash) => hash,
            Err(e) => {
                error!(request_id = %id, "Execute submission failed: {}", e);
                request.execute_status = ExecuteStatus::Failed;
                request.execute_error = Some(e.to_string());
                self.save_request(&mut request, "execute").await?;
                self.notify_request(&request);
                return Err(e);
            }
        };

        request.execute_tx_hash = Some(tx_hash.clone());
        self.save_request(&mut request, "execute").await?;
        self.track(PollingRequest::new(
            TaskType::WithdrawExecute,
            id,
            request.execute_chain_id,
            tx_hash.clone(),
            ExecuteStatus::Submitted,
            ExecuteStatus::Success,
        ))
        .await?;

        info!(request_id = %id, tx_hash = %tx_hash, "Withdrawal submitted for execution");
        self.notify_request(&request);
        Ok(request)
    }

    pub(crate) async fn confirm_execute(&self, task: &PollingTask, status: &TxStatus) -> OrchestratorResult<()> {
        let mut request = self.get_withdraw_request(task.entity_id).await?;
        if request.execute_status == ExecuteStatus::Success {
            return Ok(());
        }
        request.execute_status = ExecuteStatus::Success;
        request.execute_block = status.block_number;
        request.executed_at = Some(Utc::now());
        self.save_request(&mut request, "execute").await?;
        info!(request_id = %request.id, "Withdrawal executed in block {:?}", status.block_number);
        self.notify_request(&request);
        Ok(())
    }

    pub(crate) async fn fail_execute(&self, task: &PollingTask, reason: &str) -> OrchestratorResult<()> {
        let mut request = self.get_withdraw_request(task.entity_id).await?;
        if request.execute_status != ExecuteStatus::Submitted {
            warn!(request_id = %request.id, "Ignoring execute failure in status {}", request.execute_status);
            return Ok(());
        }
        request.execute_status = ExecuteStatus::Failed;
        request.execute_error = Some(reason.to_string());
        self.save_request(&mut request, "execute").await?;
        self.notify_request(&request);
        Ok(())
    }

    /// Payout stage. A route the worker can no longer serve falls back to a
    /// direct treasury transfer.
    pub async fn process_payout(&self, id: Uuid) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        ensure_open(&request)?;
        if request.execute_status != ExecuteStatus::Success {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} payout requires a successful execute, execute is {}",
                id, request.execute_status
            )));
        }
        if !matches!(request.payout_status, PayoutStatus::Pending | PayoutStatus::Failed) {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} payout is {}",
                id, request.payout_status
            )));
        }

        request.payout_status = PayoutStatus::Processing;
        request.payout_error = None;
        self.save_request(&mut request, "payout").await?;

        let amount = payout_amount(&request);
        let order = PayoutOrder {
            request_id: id,
            worker_type: request.worker_type,
            worker_params: request.worker_params.clone(),
            beneficiary: request.beneficiary.clone(),
            token: request.token.clone(),
            amount,
            target_chain_id: request.target_chain_id,
            constraints: request.route.clone(),
        };

        match self.payouts.execute(order).await {
            Ok(receipt) => {
                request.actual_output = Some(receipt.actual_output);
                request.payout_chain_id = Some(receipt.chain_id);
                request.bridge = receipt.bridge;
                match receipt.tx_hash {
                    Some(tx_hash) => {
                        request.payout_tx_hash = Some(tx_hash.clone());
                        self.save_request(&mut request, "payout").await?;
                        self.track(PollingRequest::new(
                            TaskType::WithdrawPayout,
                            id,
                            receipt.chain_id,
                            tx_hash,
                            PayoutStatus::Processing,
                            PayoutStatus::Completed,
                        ))
                        .await?;
                        self.notify_request(&request);
                        Ok(request)
                    }
                    None => {
                        self.save_request(&mut request, "payout").await?;
                        self.complete_payout(id, receipt.chain_id, None).await
                    }
                }
            }
            Err(PayoutError::Retryable(message)) => {
                warn!(request_id = %id, "Payout failed: {}", message);
                request.payout_status = PayoutStatus::Failed;
                request.payout_error = Some(message.clone());
                self.save_request(&mut request, "payout").await?;
                self.notify_request(&request);
                Err(OrchestratorError::external("payout worker", message))
            }
            Err(PayoutError::RouteInvalid(message)) => {
                warn!(request_id = %id, "Payout route invalid, falling back to treasury transfer: {}", message);
                request.payout_error = Some(message);
                self.fallback_transfer(request, amount).await
            }
        }
    }

    async fn fallback_transfer(
        &self,
        mut request: WithdrawRequest,
        amount: U256,
    ) -> OrchestratorResult<WithdrawRequest> {
        let attempts = request.fallback.retry.count;
        if attempts >= self.config.stage_retry_limit {
            request.payout_status = PayoutStatus::Failed;
            self.save_request(&mut request, "payout").await?;
            self.notify_request(&request);
            return Err(OrchestratorError::RetryExhausted {
                what: format!("fallback transfer for {}", request.id),
                attempts,
            });
        }

        let call = ContractCall::FallbackTransfer {
            request_id: request.id,
            beneficiary: request.beneficiary.clone(),
            token: request.token.clone(),
            amount,
        };
        match self.chain.submit(request.target_chain_id, call).await {
            Ok(tx_hash) => {
                request.fallback.tx_hash = Some(tx_hash.clone());
                request.fallback.error = None;
                request.payout_tx_hash = Some(tx_hash.clone());
                request.payout_chain_id = Some(request.target_chain_id);
                request.actual_output = Some(amount);
                self.save_request(&mut request, "payout").await?;
                self.track(PollingRequest::new(
                    TaskType::WithdrawPayout,
                    request.id,
                    request.target_chain_id,
                    tx_hash.clone(),
                    PayoutStatus::Processing,
                    PayoutStatus::Completed,
                ))
                .await?;
                info!(request_id = %request.id, tx_hash = %tx_hash, "Fallback transfer submitted");
                self.notify_request(&request);
                Ok(request)
            }
            Err(e) => {
                error!(request_id = %request.id, "Fallback transfer failed: {}", e);
                request.fallback.error = Some(e.to_string());
                request.fallback.retry.bump();
                request.payout_status = PayoutStatus::Failed;
                self.save_request(&mut request, "payout").await?;
                self.notify_request(&request);
                Err(e)
            }
        }
    }

    /// Mark the payout delivered and spend the allocations. Repeating it for
    /// a completed payout changes nothing.
    pub async fn complete_payout(
        &self,
        id: Uuid,
        chain_id: u64,
        block_number: Option<u64>,
    ) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        if request.payout_status == PayoutStatus::Completed {
            // Finishes a consume that an earlier completion did not reach
            self.store.consume_allocations(id).await?;
            return Ok(request);
        }
        if request.execute_status != ExecuteStatus::Success {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} cannot complete payout before execute succeeds",
                id
            )));
        }

        request.payout_status = PayoutStatus::Completed;
        request.payout_error = None;
        request.payout_block = block_number;
        request.payout_completed_at = Some(Utc::now());
        request.payout_chain_id = Some(chain_id);
        request.cross_chain = chain_id != request.execute_chain_id;
        request.fallback.transferred =
            request.fallback.tx_hash.is_some() && request.fallback.tx_hash == request.payout_tx_hash;
        self.save_request(&mut request, "payout").await?;

        let consumed = self.store.consume_allocations(id).await?;
        info!(
            request_id = %id,
            chain_id,
            cross_chain = request.cross_chain,
            "Payout completed, {} allocations spent",
            consumed
        );
        self.notify_request(&request);
        Ok(request)
    }

    pub(crate) async fn confirm_payout(&self, task: &PollingTask, status: &TxStatus) -> OrchestratorResult<()> {
        self.complete_payout(task.entity_id, task.chain_id, status.block_number)
            .await
            .map(|_| ())
    }

    pub(crate) async fn fail_payout(&self, task: &PollingTask, reason: &str) -> OrchestratorResult<()> {
        let mut request = self.get_withdraw_request(task.entity_id).await?;
        if request.payout_status != PayoutStatus::Processing {
            warn!(request_id = %request.id, "Ignoring payout failure in status {}", request.payout_status);
            return Ok(());
        }
        if request.fallback.tx_hash.as_deref() == Some(task.tx_hash.as_str()) {
            request.fallback.error = Some(reason.to_string());
            request.fallback.retry.bump();
        }
        request.payout_status = PayoutStatus::Failed;
        request.payout_error = Some(reason.to_string());
        self.save_request(&mut request, "payout").await?;
        self.notify_request(&request);
        Ok(())
    }

    /// Hook stage: the post-payout call requested by the withdraw event
    pub async fn process_hook(&self, id: Uuid) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        ensure_open(&request)?;
        if request.payout_status != PayoutStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} hook requires a completed payout",
                id
            )));
        }
        if !matches!(request.hook_status, HookStatus::Pending | HookStatus::Failed) {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} hook is {}",
                id, request.hook_status
            )));
        }
        let calldata = request.hook_calldata.clone().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("withdraw request {} has no hook calldata", id))
        })?;

        request.hook_status = HookStatus::Processing;
        request.hook_error = None;
        self.save_request(&mut request, "hook").await?;

        let chain_id = request.payout_chain_id.unwrap_or(request.target_chain_id);
        let call = ContractCall::ExecuteHook {
            request_id: id,
            beneficiary: request.beneficiary.clone(),
            calldata,
        };
        let tx_hash = match self.chain.submit(chain_id, call).await {
            Ok(hash) => hash,
            Err(e) => {
                error!(request_id = %id, "Hook submission failed: {}", e);
                request.hook_status = HookStatus::Failed;
                request.hook_error = Some(e.to_string());
                self.save_request(&mut request, "hook").await?;
                self.notify_request(&request);
                return Err(e);
            }
        };

        request.hook_tx_hash = Some(tx_hash.clone());
        self.save_request(&mut request, "hook").await?;
        self.track(PollingRequest::new(
            TaskType::WithdrawHook,
            id,
            chain_id,
            tx_hash.clone(),
            HookStatus::Processing,
            HookStatus::Completed,
        ))
        .await?;

        info!(request_id = %id, tx_hash = %tx_hash, "Hook submitted");
        Ok(request)
    }

    pub(crate) async fn confirm_hook(&self, task: &PollingTask, _status: &TxStatus) -> OrchestratorResult<()> {
        let mut request = self.get_withdraw_request(task.entity_id).await?;
        if request.hook_status == HookStatus::Completed {
            return Ok(());
        }
        request.hook_status = HookStatus::Completed;
        request.hook_completed_at = Some(Utc::now());
        self.save_request(&mut request, "hook").await?;
        info!(request_id = %request.id, "Withdraw request completed");
        self.notify_request(&request);
        Ok(())
    }

    pub(crate) async fn fail_hook(&self, task: &PollingTask, reason: &str) -> OrchestratorResult<()> {
        let mut request = self.get_withdraw_request(task.entity_id).await?;
        if request.hook_status != HookStatus::Processing {
            return Ok(());
        }
        request.hook_status = HookStatus::Failed;
        request.hook_error = Some(reason.to_string());
        self.save_request(&mut request, "hook").await?;
        self.notify_request(&request);
        Ok(())
    }

    /// Reopen one stage and run the pipeline from there
    pub async fn retry_withdraw_stage(&self, id: Uuid, step: RetryStep) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        ensure_open(&request)?;
        let limit = self.config.stage_retry_limit;

        match step {
            RetryStep::Proof => {
                if matches!(request.execute_status, ExecuteStatus::Submitted | ExecuteStatus::Success) {
                    return Err(OrchestratorError::InvalidState(format!(
                        "withdraw request {} proof was already used by execute",
                        id
                    )));
                }
                request.reset_for_restart();
                request.proof_retry.bump();
            }
            RetryStep::Execute => {
                if request.proof_status != ProofStatus::Completed {
                    return Err(OrchestratorError::InvalidState(format!(
                        "withdraw request {} has no completed proof",
                        id
                    )));
                }
                if matches!(request.execute_status, ExecuteStatus::Submitted | ExecuteStatus::Success) {
                    return Err(OrchestratorError::InvalidState(format!(
                        "withdraw request {} execute is {}",
                        id, request.execute_status
                    )));
                }
                request.execute_status = ExecuteStatus::Pending;
                request.execute_error = None;
                // Payout progress from an earlier attempt is void
                if request.payout_status != PayoutStatus::Pending {
                    request.payout_status = PayoutStatus::Pending;
                    request.payout_error = None;
                    request.payout_tx_hash = None;
                }
                request.execute_retry.bump();
            }
            RetryStep::Payout => {
                if request.payout_retry.count >= limit {
                    return Err(OrchestratorError::RetryExhausted {
                        what: format!("payout for {}", id),
                        attempts: request.payout_retry.count,
                    });
                }
                if request.execute_status != ExecuteStatus::Success {
                    return Err(OrchestratorError::InvalidState(format!(
                        "withdraw request {} execute is {}",
                        id, request.execute_status
                    )));
                }
                if matches!(request.payout_status, PayoutStatus::Processing | PayoutStatus::Completed) {
                    return Err(OrchestratorError::InvalidState(format!(
                        "withdraw request {} payout is {}",
                        id, request.payout_status
                    )));
                }
                request.payout_status = PayoutStatus::Pending;
                request.payout_retry.bump();
            }
            RetryStep::Hook => {
                if request.hook_retry.count >= limit {
                    return Err(OrchestratorError::RetryExhausted {
                        what: format!("hook for {}", id),
                        attempts: request.hook_retry.count,
                    });
                }
                if request.hook_status != HookStatus::Failed {
                    return Err(OrchestratorError::InvalidState(format!(
                        "withdraw request {} hook is {}",
                        id, request.hook_status
                    )));
                }
                request.hook_status = HookStatus::Pending;
                request.hook_retry.bump();
            }
            other => {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "{} is not a withdraw stage",
                    other
                )))
            }
        }

        self.save_request(&mut request, step.as_str()).await?;
        info!(request_id = %id, "Retrying withdraw request from {}", step);
        self.advance(id).await
    }

    /// Drop the proof and everything derived from it, then prove again
    pub async fn restart_withdraw_request(&self, id: Uuid) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        ensure_open(&request)?;
        if request.is_settled() {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} is already completed",
                id
            )));
        }
        match request.execute_status {
            ExecuteStatus::Submitted => {
                return Err(OrchestratorError::InvalidState(format!(
                    "withdraw request {} has an execute transaction in flight",
                    id
                )))
            }
            // The allocations are spent on chain; only payout and hook can move on
            ExecuteStatus::Success => {
                return Err(OrchestratorError::InvalidState(format!(
                    "withdraw request {} already executed, retry payout or hook instead",
                    id
                )))
            }
            ExecuteStatus::Pending | ExecuteStatus::Failed => {}
        }

        request.reset_for_restart();
        request.proof_retry.bump();
        self.save_request(&mut request, "proof").await?;
        info!(request_id = %id, "Withdraw request restarted from proof generation");
        self.advance(id).await
    }

    pub async fn can_cancel(&self, id: Uuid) -> OrchestratorResult<bool> {
        Ok(self.get_withdraw_request(id).await?.can_cancel())
    }

    /// Cancel a request whose execute has not been submitted, returning its
    /// allocations to idle
    pub async fn cancel_withdraw_request(&self, id: Uuid, reason: &str) -> OrchestratorResult<WithdrawRequest> {
        let mut request = self.get_withdraw_request(id).await?;
        if !request.can_cancel() {
            return Err(OrchestratorError::InvalidState(format!(
                "withdraw request {} can no longer be cancelled ({})",
                id, request.status
            )));
        }

        request.status = RequestStatus::Cancelled;
        self.save_request(&mut request, "cancel").await?;
        let released = self.store.release_allocations(id).await?;
        self.queue
            .cancel_tasks_for_entity(EntityType::WithdrawRequest, id, reason)
            .await?;

        info!(request_id = %id, "Withdraw request cancelled ({}), {} allocations released", reason, released);
        self.notify_request(&request);
        Ok(request)
    }

    /// Fail proofs that have been in progress longer than the proof timeout
    pub async fn sweep_stale_proofs(&self) -> OrchestratorResult<usize> {
        let timeout = self.config.proof_timeout_secs;
        let cutoff = Utc::now() - Duration::seconds(timeout as i64);
        let stale = self.store.list_stale_proofs(cutoff).await?;

        let mut failed = 0;
        for mut request in stale {
            request.proof_status = ProofStatus::Failed;
            request.proof_error = Some(format!("proof generation timed out after {}s", timeout));
            match self.save_request(&mut request, "proof").await {
                Ok(()) => {
                    failed += 1;
                    warn!(request_id = %request.id, "Proof generation timed out");
                    self.notify_request(&request);
                }
                Err(e) if e.is_concurrent_modification() => {
                    debug!(request_id = %request.id, "Proof finished while sweeping");
                }
                Err(e) => warn!(request_id = %request.id, "Could not fail stale proof: {}", e),
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, harness_with, test_config, Harness, Mocks};
    use super::*;
    use crate::collaborators::{PayoutReceipt, ProofOutput};
    use crate::models::Allocation;
    use crate::status::TaskStatus;
    use crate::store::Store;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const OWNER: &str = "0xowner";

    fn proof_ok(mocks: &mut Mocks) {
        mocks.proofs.expect_generate_proof().returning(|_| {
            Ok(ProofOutput {
                proof: "0xproof".to_string(),
                public_values: "0xpv".to_string(),
                commitment: None,
            })
        });
    }

    /// A committed checkbook with the given allocation amounts
    async fn allocations(h: &Harness, amounts: &[u64]) -> Vec<Allocation> {
        let amounts: Vec<U256> = amounts.iter().map(|a| U256::from(*a)).collect();
        let total = amounts.iter().fold(U256::zero(), |sum, a| sum + *a);
        let checkbook = h.orchestrator.create_checkbook(OWNER, 56, total).await.unwrap();
        h.orchestrator.mark_unsigned(checkbook.id).await.unwrap();
        let allocations = h
            .orchestrator
            .submit_signature(checkbook.id, "0xsig", &amounts)
            .await
            .unwrap();
        let mut stored = h.store.get_checkbook(checkbook.id).await.unwrap().unwrap();
        stored.status = CheckbookStatus::WithCheckbook;
        h.store.update_checkbook(&mut stored).await.unwrap();
        allocations
    }

    fn input(allocations: &[Allocation], target_chain_id: u64) -> CreateWithdrawRequest {
        CreateWithdrawRequest {
            owner: OWNER.to_string(),
            beneficiary: "0x00000000000000000000000000000000000000b0".to_string(),
            intent_type: IntentType::RawToken,
            token: "0x00000000000000000000000000000000000000c0".to_string(),
            allocation_ids: allocations.iter().map(|a| a.id).collect(),
            target_chain_id,
            worker_type: WorkerType::DirectTransfer,
            worker_params: serde_json::json!({}),
            route: RouteConstraints::default(),
            hook_calldata: None,
        }
    }

    async fn allocation_statuses(h: &Harness, allocations: &[Allocation]) -> Vec<AllocationStatus> {
        let ids: Vec<Uuid> = allocations.iter().map(|a| a.id).collect();
        h.store
            .get_allocations(&ids)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.status)
            .collect()
    }

    /// Drive a request to a confirmed execute
    async fn executed(h: &Harness, id: Uuid) {
        let request = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(request.execute_status, ExecuteStatus::Submitted);
        let task = h
            .queue
            .list_tasks_by_entity(EntityType::WithdrawRequest, id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::WithdrawExecute)
            .unwrap();
        h.orchestrator
            .confirm_execute(&task, &TxStatus::confirmed(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn creation_claims_allocations_once() {
        let h = harness(Mocks::new());
        let allocs = allocations(&h, &[600, 400]).await;

        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();
        assert_eq!(request.amount, U256::from(1_000u64));
        assert_eq!(request.fee_rate_bps, Some(30));
        assert_eq!(request.status, RequestStatus::Created);
        assert_eq!(
            allocation_statuses(&h, &allocs).await,
            vec![AllocationStatus::Pending, AllocationStatus::Pending]
        );

        let err = h
            .orchestrator
            .create_withdraw_request(input(&allocs[..1], 56))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn creation_checks_ownership_and_commitment() {
        let h = harness(Mocks::new());
        let allocs = allocations(&h, &[500]).await;

        let mut stranger = input(&allocs, 56);
        stranger.owner = "0xsomeoneelse".to_string();
        let err = h.orchestrator.create_withdraw_request(stranger).await.unwrap_err();
        assert_eq!(err.code(), "invalid_argument");

        let unsigned = h
            .orchestrator
            .create_checkbook(OWNER, 56, U256::from(10u64))
            .await
            .unwrap();
        h.orchestrator.mark_unsigned(unsigned.id).await.unwrap();
        let uncommitted = h
            .orchestrator
            .submit_signature(unsigned.id, "0xsig", &[U256::from(10u64)])
            .await
            .unwrap();
        let err = h
            .orchestrator
            .create_withdraw_request(input(&uncommitted, 56))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");

        // Nothing was claimed by the refused requests
        assert_eq!(allocation_statuses(&h, &allocs).await, vec![AllocationStatus::Idle]);
    }

    #[tokio::test]
    async fn completed_payout_spends_allocations_exactly_once() {
        let mut mocks = Mocks::new();
        proof_ok(&mut mocks);
        mocks
            .chain
            .expect_submit()
            .times(1)
            .withf(|chain_id, call| *chain_id == 56 && call.name() == "execute_withdraw")
            .returning(|_, _| Ok("0xexec".to_string()));
        mocks
            .payouts
            .expect_execute()
            .times(1)
            .withf(|order| order.amount == U256::from(997u64) && order.target_chain_id == 1)
            .returning(|_| {
                Ok(PayoutReceipt {
                    actual_output: U256::from(995u64),
                    chain_id: 1,
                    tx_hash: None,
                    bridge: None,
                })
            });
        let h = harness(mocks);
        let allocs = allocations(&h, &[600, 400]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 1))
            .await
            .unwrap();

        executed(&h, request.id).await;
        assert_eq!(
            allocation_statuses(&h, &allocs).await,
            vec![AllocationStatus::Pending, AllocationStatus::Pending]
        );

        let done = h.orchestrator.advance(request.id).await.unwrap();
        assert_eq!(done.payout_status, PayoutStatus::Completed);
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.actual_output, Some(U256::from(995u64)));
        assert!(done.cross_chain);
        assert_eq!(
            allocation_statuses(&h, &allocs).await,
            vec![AllocationStatus::Used, AllocationStatus::Used]
        );

        let again = tokio_test::assert_ok!(h.orchestrator.complete_payout(request.id, 1, Some(5)).await);
        assert_eq!(again.version, done.version);
        assert_eq!(again.payout_block, None);
    }

    #[tokio::test]
    async fn invalid_route_falls_back_to_treasury_transfer() {
        let mut mocks = Mocks::new();
        proof_ok(&mut mocks);
        mocks
            .chain
            .expect_submit()
            .withf(|_, call| call.name() == "execute_withdraw")
            .returning(|_, _| Ok("0xexec".to_string()));
        mocks
            .chain
            .expect_submit()
            .times(1)
            .withf(|chain_id, call| *chain_id == 56 && call.name() == "fallback_transfer")
            .returning(|_, _| Ok("0xfallback".to_string()));
        mocks
            .payouts
            .expect_execute()
            .returning(|_| Err(PayoutError::RouteInvalid("pool drained".to_string())));
        let h = harness(mocks);
        let allocs = allocations(&h, &[1_000]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();
        executed(&h, request.id).await;

        let processing = h.orchestrator.advance(request.id).await.unwrap();
        assert_eq!(processing.payout_status, PayoutStatus::Processing);
        assert_eq!(processing.fallback.tx_hash.as_deref(), Some("0xfallback"));
        assert_eq!(processing.payout_error.as_deref(), Some("pool drained"));

        let task = h
            .queue
            .list_tasks_by_entity(EntityType::WithdrawRequest, request.id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::WithdrawPayout && t.status == TaskStatus::Pending)
            .unwrap();
        assert_eq!(task.tx_hash, "0xfallback");
        h.orchestrator
            .confirm_payout(&task, &TxStatus::confirmed(120))
            .await
            .unwrap();

        let done = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(done.payout_status, PayoutStatus::Completed);
        assert!(done.fallback.transferred);
        assert!(!done.cross_chain);
    }

    #[tokio::test]
    async fn retryable_payout_failure_keeps_allocations_pending() {
        let mut mocks = Mocks::new();
        proof_ok(&mut mocks);
        mocks
            .chain
            .expect_submit()
            .returning(|_, _| Ok("0xexec".to_string()));
        mocks
            .payouts
            .expect_execute()
            .returning(|_| Err(PayoutError::Retryable("rpc timeout".to_string())));
        let h = harness(mocks);
        let allocs = allocations(&h, &[1_000]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();
        executed(&h, request.id).await;

        let err = h.orchestrator.advance(request.id).await.unwrap_err();
        assert_eq!(err.code(), "external_failure");
        let failed = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(failed.status, RequestStatus::PayoutFailed);
        assert_eq!(allocation_statuses(&h, &allocs).await, vec![AllocationStatus::Pending]);
    }

    #[tokio::test]
    async fn restart_is_refused_once_execute_succeeded() {
        let mut mocks = Mocks::new();
        proof_ok(&mut mocks);
        mocks
            .chain
            .expect_submit()
            .times(1)
            .returning(|_, _| Ok("0xexec".to_string()));
        mocks
            .payouts
            .expect_execute()
            .times(2)
            .returning(|_| Err(PayoutError::Retryable("rpc timeout".to_string())));
        let h = harness(mocks);
        let allocs = allocations(&h, &[1_000]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();
        executed(&h, request.id).await;
        h.orchestrator.advance(request.id).await.unwrap_err();

        let err = h
            .orchestrator
            .restart_withdraw_request(request.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");
        let unchanged = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(unchanged.proof.as_deref(), Some("0xproof"));
        assert_eq!(unchanged.execute_status, ExecuteStatus::Success);
        assert_eq!(unchanged.status, RequestStatus::PayoutFailed);

        // The payout itself can still be retried
        let err = h
            .orchestrator
            .retry_withdraw_stage(request.id, RetryStep::Payout)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "external_failure");
        let retried = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(retried.payout_retry.count, 1);
    }

    #[tokio::test]
    async fn restart_after_failed_execute_runs_the_whole_pipeline_again() {
        let proofs = Arc::new(AtomicUsize::new(0));
        let mut mocks = Mocks::new();
        let counter = proofs.clone();
        mocks.proofs.expect_generate_proof().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(ProofOutput {
                proof: format!("0xproof{}", n),
                public_values: "0xpv".to_string(),
                commitment: None,
            })
        });
        mocks
            .chain
            .expect_submit()
            .returning(|_, _| Ok("0xexec".to_string()));
        let h = harness(mocks);
        let allocs = allocations(&h, &[1_000]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();
        h.orchestrator.advance(request.id).await.unwrap();
        let task = h
            .queue
            .list_tasks_by_entity(EntityType::WithdrawRequest, request.id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::WithdrawExecute)
            .unwrap();
        h.orchestrator.fail_execute(&task, "reverted").await.unwrap();

        let restarted = h
            .orchestrator
            .restart_withdraw_request(request.id)
            .await
            .unwrap();
        assert_eq!(restarted.proof.as_deref(), Some("0xproof1"));
        assert_eq!(restarted.execute_status, ExecuteStatus::Submitted);
        assert!(restarted.execute_error.is_none());
        assert_eq!(restarted.payout_status, PayoutStatus::Pending);
        assert_eq!(restarted.proof_retry.count, 1);
    }

    #[tokio::test]
    async fn hook_runs_after_payout() {
        let mut mocks = Mocks::new();
        proof_ok(&mut mocks);
        mocks
            .chain
            .expect_submit()
            .withf(|_, call| call.name() == "execute_withdraw")
            .returning(|_, _| Ok("0xexec".to_string()));
        mocks
            .chain
            .expect_submit()
            .times(1)
            .withf(|chain_id, call| *chain_id == 1 && call.name() == "execute_hook")
            .returning(|_, _| Ok("0xhook".to_string()));
        mocks.payouts.expect_execute().returning(|_| {
            Ok(PayoutReceipt {
                actual_output: U256::from(990u64),
                chain_id: 1,
                tx_hash: None,
                bridge: None,
            })
        });
        let h = harness(mocks);
        let allocs = allocations(&h, &[1_000]).await;
        let hook = HookCalldata {
            intent_type: 1,
            chain_id: 1,
            token_id: 3,
            worker_id: 2,
            min_output_amount: U256::from(900u64),
        };
        let mut with_hook = input(&allocs, 1);
        with_hook.hook_calldata = Some(format!("0x{}", hex::encode(hook.encode())));
        let request = h.orchestrator.create_withdraw_request(with_hook).await.unwrap();
        assert_eq!(request.hook_status, HookStatus::Pending);
        executed(&h, request.id).await;

        let hooked = h.orchestrator.advance(request.id).await.unwrap();
        assert_eq!(hooked.payout_status, PayoutStatus::Completed);
        assert_eq!(hooked.hook_status, HookStatus::Processing);
        assert_eq!(hooked.status, RequestStatus::HookProcessing);
        assert!(!hooked.is_settled());

        let task = h
            .queue
            .list_tasks_by_entity(EntityType::WithdrawRequest, request.id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::WithdrawHook)
            .unwrap();
        h.orchestrator
            .confirm_hook(&task, &TxStatus::confirmed(130))
            .await
            .unwrap();
        let done = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_releases_allocations_until_execute_is_submitted() {
        let mut mocks = Mocks::new();
        proof_ok(&mut mocks);
        mocks
            .chain
            .expect_submit()
            .returning(|_, _| Ok("0xexec".to_string()));
        let h = harness(mocks);
        let allocs = allocations(&h, &[300, 700]).await;

        let first = h
            .orchestrator
            .create_withdraw_request(input(&allocs[..1], 56))
            .await
            .unwrap();
        assert!(h.orchestrator.can_cancel(first.id).await.unwrap());
        let cancelled = h
            .orchestrator
            .cancel_withdraw_request(first.id, "user request")
            .await
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(allocation_statuses(&h, &allocs[..1]).await, vec![AllocationStatus::Idle]);
        assert!(h.orchestrator.advance(first.id).await.unwrap().status == RequestStatus::Cancelled);

        let second = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();
        h.orchestrator.advance(second.id).await.unwrap();
        assert!(!h.orchestrator.can_cancel(second.id).await.unwrap());
        let err = h
            .orchestrator
            .cancel_withdraw_request(second.id, "user request")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn stuck_proof_is_failed_by_the_sweep() {
        let mut config = test_config();
        config.proof_timeout_secs = 0;
        let h = harness_with(Mocks::new(), config);
        let allocs = allocations(&h, &[1_000]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();

        let mut stuck = h.store.get_withdraw_request(request.id).await.unwrap().unwrap();
        stuck.proof_status = ProofStatus::InProgress;
        h.store.update_withdraw_request(&mut stuck).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(h.orchestrator.sweep_stale_proofs().await.unwrap(), 1);
        let failed = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(failed.proof_status, ProofStatus::Failed);
        assert_eq!(failed.status, RequestStatus::ProofFailed);
        assert!(failed.proof_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn recovery_sweep_starts_a_lost_payout() {
        let mut mocks = Mocks::new();
        mocks.payouts.expect_execute().times(1).returning(|_| {
            Ok(PayoutReceipt {
                actual_output: U256::from(1_000u64),
                chain_id: 56,
                tx_hash: Some("0xpayout".to_string()),
                bridge: None,
            })
        });
        let h = harness(mocks);
        let allocs = allocations(&h, &[1_000]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();

        let mut stored = h.store.get_withdraw_request(request.id).await.unwrap().unwrap();
        stored.proof_status = ProofStatus::Completed;
        stored.execute_status = ExecuteStatus::Success;
        h.store.update_withdraw_request(&mut stored).await.unwrap();

        assert_eq!(h.orchestrator.resume_awaiting_payout().await.unwrap(), 1);
        let processing = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(processing.payout_status, PayoutStatus::Processing);
        assert_eq!(processing.payout_tx_hash.as_deref(), Some("0xpayout"));
    }

    async fn submitted_execute(h: &Harness, tx_hash: Option<&str>) -> Uuid {
        let allocs = allocations(h, &[1_000]).await;
        let request = h
            .orchestrator
            .create_withdraw_request(input(&allocs, 56))
            .await
            .unwrap();
        let mut stored = h.store.get_withdraw_request(request.id).await.unwrap().unwrap();
        stored.proof_status = ProofStatus::Completed;
        stored.execute_status = ExecuteStatus::Submitted;
        stored.execute_tx_hash = tx_hash.map(str::to_string);
        h.store.update_withdraw_request(&mut stored).await.unwrap();
        request.id
    }

    #[tokio::test]
    async fn recovery_sweep_reattaches_lost_execute_tracking() {
        let mut config = test_config();
        config.sweep_interval_secs = 0;
        let h = harness_with(Mocks::new(), config);
        let id = submitted_execute(&h, Some("0xexec")).await;

        assert_eq!(h.orchestrator.recover_untracked().await.unwrap(), 1);
        let tasks = h
            .queue
            .list_tasks_by_entity(EntityType::WithdrawRequest, id)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::WithdrawExecute);
        assert_eq!(tasks[0].tx_hash, "0xexec");
        assert_eq!(tasks[0].status, TaskStatus::Pending);

        // Tracked now, nothing left to recover
        assert_eq!(h.orchestrator.recover_untracked().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recovery_sweep_fails_an_interrupted_execute() {
        let mut config = test_config();
        config.sweep_interval_secs = 0;
        let h = harness_with(Mocks::new(), config);
        let id = submitted_execute(&h, None).await;

        assert_eq!(h.orchestrator.recover_untracked().await.unwrap(), 1);
        let failed = h.orchestrator.get_withdraw_request(id).await.unwrap();
        assert_eq!(failed.execute_status, ExecuteStatus::Failed);
        assert!(failed.execute_error.unwrap().contains("interrupted"));
        assert!(h
            .queue
            .list_tasks_by_entity(EntityType::WithdrawRequest, id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn recovery_sweep_leaves_fresh_submissions_alone() {
        let h = harness(Mocks::new());
        let id = submitted_execute(&h, None).await;

        assert_eq!(h.orchestrator.recover_untracked().await.unwrap(), 0);
        let request = h.orchestrator.get_withdraw_request(id).await.unwrap();
        assert_eq!(request.execute_status, ExecuteStatus::Submitted);
    }
}
