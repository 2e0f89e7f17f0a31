use crate::status::ProposalStatus;

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Input for a new proposal
#[derive(Debug, Clone, Deserialize)]
pub struct NewProposal {
    pub chain_id: u64,
    pub action_type: String,
    pub request_id: Option<Uuid>,
    pub source_tx_hash: Option<String>,
    pub target_contract: String,
    #[serde(default, with = "super::decimal")]
    pub value: U256,
    pub call_data: String,
    pub description: String,
    pub proposer: String,
    pub required_signatures: Option<u32>,
    pub ttl_secs: Option<i64>,
}

/// A privileged action waiting for threshold approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultisigProposal {
    pub id: Uuid,
    pub chain_id: u64,
    pub action_type: String,
    pub request_id: Option<Uuid>,
    pub source_tx_hash: Option<String>,
    pub multisig_address: String,
    pub target_contract: String,
    #[serde(with = "super::decimal")]
    pub value: U256,
    pub call_data: String,
    pub description: String,
    pub status: ProposalStatus,
    pub proposer: String,
    pub signature_count: u32,
    pub required_signatures: u32,
    pub rejection_count: u32,
    pub rejection_threshold: u32,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub execute_tx_hash: Option<String>,
    pub execute_block: Option<u64>,
    pub execute_success: Option<bool>,
    pub return_data: Option<String>,
    pub error_reason: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl MultisigProposal {
    pub fn has_quorum(&self) -> bool {
        self.signature_count >= self.required_signatures
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

/// One signer's approval, unique per proposal and signer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultisigSignature {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub signer: String,
    pub chain_id: u64,
    pub tx_hash: Option<String>,
    pub signed_at: DateTime<Utc>,
}

/// One signer's rejection, unique per proposal and signer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultisigRejection {
    pub proposal_id: Uuid,
    pub signer: String,
    pub reason: Option<String>,
    pub rejected_at: DateTime<Utc>,
}

/// What the chain reported for an execution transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub executor: String,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub success: bool,
    pub return_data: Option<String>,
    pub error_reason: Option<String>,
}

/// One completed on-chain attempt, keyed by its transaction hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultisigExecution {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub executor: String,
    pub execute_tx_hash: String,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub success: bool,
    pub return_data: Option<String>,
    pub error_reason: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl MultisigExecution {
    pub fn from_report(proposal_id: Uuid, report: &ExecutionReport) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            executor: report.executor.clone(),
            execute_tx_hash: report.tx_hash.clone(),
            block_number: report.block_number,
            gas_used: report.gas_used,
            success: report.success,
            return_data: report.return_data.clone(),
            error_reason: report.error_reason.clone(),
            executed_at: Utc::now(),
        }
    }
}
