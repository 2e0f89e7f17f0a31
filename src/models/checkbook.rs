use crate::error::{OrchestratorError, OrchestratorResult};
use crate::status::{AllocationStatus, CheckbookStatus};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One deposit converted into a spendable commitment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkbook {
    pub id: Uuid,
    pub owner: String,
    pub chain_id: u64,
    #[serde(with = "super::decimal")]
    pub amount: U256,
    pub status: CheckbookStatus,
    /// User signature collected while unsigned; kept across retries
    pub signature: Option<String>,
    pub proof: Option<String>,
    pub proved_at: Option<DateTime<Utc>>,
    pub commitment: Option<String>,
    pub commitment_tx_hash: Option<String>,
    pub commitment_block: Option<u64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkbook {
    pub fn new(owner: impl Into<String>, chain_id: u64, amount: U256) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            chain_id,
            amount,
            status: CheckbookStatus::Pending,
            signature: None,
            proof: None,
            proved_at: None,
            commitment: None,
            commitment_tx_hash: None,
            commitment_block: None,
            retry_count: 0,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move along the state machine, refusing illegal transitions
    pub fn transition(&mut self, next: CheckbookStatus) -> OrchestratorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidState(format!(
                "checkbook {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Record a stage failure. The failure status must be reachable from the current one.
    pub fn fail(&mut self, failure: CheckbookStatus, reason: impl Into<String>) -> OrchestratorResult<()> {
        debug_assert!(failure.is_failure());
        self.transition(failure)?;
        self.retry_count += 1;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Seal the commitment. A different value never replaces an existing one.
    pub fn seal_commitment(&mut self, commitment: &str) -> OrchestratorResult<()> {
        match &self.commitment {
            Some(existing) if existing != commitment => Err(OrchestratorError::InvalidState(format!(
                "checkbook {} already sealed with commitment {}",
                self.id, existing
            ))),
            _ => {
                self.commitment = Some(commitment.to_string());
                Ok(())
            }
        }
    }

    /// Drop proof and commitment ahead of a forced restart
    pub fn clear_proof_artifacts(&mut self) {
        self.proof = None;
        self.proved_at = None;
        self.commitment = None;
        self.commitment_tx_hash = None;
        self.commitment_block = None;
    }

    pub fn can_retry(&self) -> bool {
        self.status.is_failure()
    }
}

/// A spendable slice of a checkbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub checkbook_id: Uuid,
    pub seq: u8,
    #[serde(with = "super::decimal")]
    pub amount: U256,
    pub status: AllocationStatus,
    pub withdraw_request_id: Option<Uuid>,
    pub nullifier: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(checkbook_id: Uuid, seq: u8, amount: U256) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            checkbook_id,
            seq,
            amount,
            status: AllocationStatus::Idle,
            withdraw_request_id: None,
            nullifier: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_counts_and_keeps_signature() {
        let mut cb = Checkbook::new("0xabc", 56, U256::from(100));
        cb.status = CheckbookStatus::GeneratingProof;
        cb.signature = Some("0xsig".into());

        cb.fail(CheckbookStatus::ProofFailed, "zkvm timeout").unwrap();
        assert_eq!(cb.status, CheckbookStatus::ProofFailed);
        assert_eq!(cb.retry_count, 1);
        assert_eq!(cb.signature.as_deref(), Some("0xsig"));
        assert!(cb.can_retry());
    }

    #[test]
    fn commitment_cannot_be_replaced() {
        let mut cb = Checkbook::new("0xabc", 56, U256::from(100));
        cb.seal_commitment("0x01").unwrap();
        cb.seal_commitment("0x01").unwrap();
        assert!(cb.seal_commitment("0x02").is_err());
        assert_eq!(cb.commitment.as_deref(), Some("0x01"));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut cb = Checkbook::new("0xabc", 56, U256::from(100));
        let err = cb.transition(CheckbookStatus::WithCheckbook).unwrap_err();
        assert_eq!(err.code(), "invalid_state");
        assert_eq!(cb.status, CheckbookStatus::Pending);
    }
}
