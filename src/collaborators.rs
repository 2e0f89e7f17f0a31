//! Interfaces to the external systems the orchestrator drives
//!
//! Proof generation, chain submission, payout delivery, fee lookup and
//! status notification all live behind these traits. Production adapters are
//! in `clients` and `chain`; tests use the generated mocks.

use crate::error::OrchestratorResult;
use crate::models::{BridgeTracking, HookCalldata, RouteConstraints, WorkerType};
use crate::status::EntityType;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Input for the proof generation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRequest {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub owner: String,
    pub chain_id: u64,
    #[serde(with = "crate::models::decimal")]
    pub amount: U256,
    /// Owner signature authorizing a commitment
    pub signature: Option<String>,
    /// Allocations spent by a withdrawal
    #[serde(default)]
    pub allocation_ids: Vec<Uuid>,
    pub beneficiary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofOutput {
    pub proof: String,
    pub public_values: String,
    /// Commitment hash, returned for checkbook proofs
    pub commitment: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProofGenerator: Send + Sync {
    async fn generate_proof(&self, request: ProofRequest) -> OrchestratorResult<ProofOutput>;
}

/// Contract calls the orchestrator can put on chain
#[derive(Debug, Clone, PartialEq)]
pub enum ContractCall {
    SubmitCommitment {
        checkbook_id: Uuid,
        commitment: String,
        proof: String,
    },
    ExecuteWithdraw {
        request_id: Uuid,
        proof: String,
        public_values: String,
    },
    FallbackTransfer {
        request_id: Uuid,
        beneficiary: String,
        token: String,
        amount: U256,
    },
    ExecuteHook {
        request_id: Uuid,
        beneficiary: String,
        calldata: HookCalldata,
    },
    ExecuteProposal {
        proposal_id: Uuid,
        multisig: String,
        target: String,
        value: U256,
        call_data: String,
    },
}

impl ContractCall {
    pub fn name(&self) -> &'static str {
        match self {
            ContractCall::SubmitCommitment { .. } => "submit_commitment",
            ContractCall::ExecuteWithdraw { .. } => "execute_withdraw",
            ContractCall::FallbackTransfer { .. } => "fallback_transfer",
            ContractCall::ExecuteHook { .. } => "execute_hook",
            ContractCall::ExecuteProposal { .. } => "execute_proposal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Pending,
    Confirmed,
    Failed,
}

/// What the chain currently says about a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxStatus {
    pub state: TxState,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub error_reason: Option<String>,
}

impl TxStatus {
    pub fn pending() -> Self {
        Self {
            state: TxState::Pending,
            block_number: None,
            gas_used: None,
            error_reason: None,
        }
    }

    pub fn confirmed(block_number: u64) -> Self {
        Self {
            state: TxState::Confirmed,
            block_number: Some(block_number),
            gas_used: None,
            error_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: TxState::Failed,
            block_number: None,
            gas_used: None,
            error_reason: Some(reason.into()),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Sign and broadcast a call, returning the transaction hash
    async fn submit(&self, chain_id: u64, call: ContractCall) -> OrchestratorResult<String>;

    async fn get_tx_status(&self, chain_id: u64, tx_hash: &str) -> OrchestratorResult<TxStatus>;
}

/// Everything the payout worker needs to deliver funds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutOrder {
    pub request_id: Uuid,
    pub worker_type: WorkerType,
    pub worker_params: serde_json::Value,
    pub beneficiary: String,
    pub token: String,
    #[serde(with = "crate::models::decimal")]
    pub amount: U256,
    pub target_chain_id: u64,
    pub constraints: RouteConstraints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    #[serde(with = "crate::models::decimal")]
    pub actual_output: U256,
    /// Chain the funds actually landed on
    pub chain_id: u64,
    /// Delivery transaction still awaiting confirmation, if any
    pub tx_hash: Option<String>,
    pub bridge: Option<BridgeTracking>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayoutError {
    #[error("payout failed: {0}")]
    Retryable(String),

    /// The route can no longer deliver; a fallback transfer takes over
    #[error("route invalid: {0}")]
    RouteInvalid(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PayoutWorker: Send + Sync {
    async fn execute(&self, order: PayoutOrder) -> Result<PayoutReceipt, PayoutError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeeOracle: Send + Sync {
    /// Fee rate in basis points for withdrawing `token` to `address` on `chain_id`
    async fn fee_rate_bps(&self, chain_id: u64, address: &str, token: &str) -> OrchestratorResult<u32>;
}

/// Status change pushed to users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub status: String,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(entity_type: EntityType, entity_id: Uuid, status: impl ToString) -> Self {
        Self {
            entity_type,
            entity_id,
            status: status.to_string(),
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: StatusEvent) -> OrchestratorResult<()>;
}

/// Deliver an event in the background. Failures are logged and never reach the caller.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, event: StatusEvent) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        let entity_id = event.entity_id;
        if let Err(e) = notifier.notify(event).await {
            warn!(entity_id = %entity_id, "Status notification failed: {}", e);
        }
    });
}
