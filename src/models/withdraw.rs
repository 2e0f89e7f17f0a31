use crate::error::{OrchestratorError, OrchestratorResult};
use crate::status::{
    ExecuteStatus, HookStatus, IntentType, PayoutStatus, ProofStatus, RequestStatus,
};

use chrono::{DateTime, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payout worker implementations known to the treasury
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    DirectTransfer,
    UniswapSwap,
    DebridgeCrossChain,
}

impl WorkerType {
    pub fn as_u8(&self) -> u8 {
        match self {
            WorkerType::DirectTransfer => 0,
            WorkerType::UniswapSwap => 1,
            WorkerType::DebridgeCrossChain => 2,
        }
    }
}

impl TryFrom<u8> for WorkerType {
    type Error = OrchestratorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WorkerType::DirectTransfer),
            1 => Ok(WorkerType::UniswapSwap),
            2 => Ok(WorkerType::DebridgeCrossChain),
            other => Err(OrchestratorError::InvalidArgument(format!(
                "unknown worker type {}",
                other
            ))),
        }
    }
}

/// Caller-supplied bounds, enforced by the payout worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConstraints {
    pub max_slippage_bps: Option<u16>,
    #[serde(default, with = "super::decimal::option")]
    pub min_output_amount: Option<U256>,
    pub payout_deadline: Option<DateTime<Utc>>,
}

impl RouteConstraints {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if let Some(bps) = self.max_slippage_bps {
            if bps > 10_000 {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "max_slippage_bps {} exceeds 10000",
                    bps
                )));
            }
        }
        Ok(())
    }
}

/// Post-payout call requested by the originating deposit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookCalldata {
    pub intent_type: u8,
    pub chain_id: u32,
    pub token_id: u16,
    pub worker_id: u16,
    #[serde(with = "super::decimal")]
    pub min_output_amount: U256,
}

impl HookCalldata {
    /// Decode the ABI tuple `(uint8, uint32, uint16, uint16, uint256)` carried by
    /// the withdraw event. Empty input means no hook.
    pub fn decode(raw: &[u8]) -> OrchestratorResult<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }

        let tokens = abi::decode(
            &[
                ParamType::Uint(8),
                ParamType::Uint(32),
                ParamType::Uint(16),
                ParamType::Uint(16),
                ParamType::Uint(256),
            ],
            raw,
        )
        .map_err(|e| OrchestratorError::InvalidArgument(format!("malformed hook calldata: {}", e)))?;

        let uint = |idx: usize| -> OrchestratorResult<U256> {
            match tokens.get(idx) {
                Some(Token::Uint(v)) => Ok(*v),
                _ => Err(OrchestratorError::InvalidArgument(format!(
                    "hook calldata field {} is not an integer",
                    idx
                ))),
            }
        };
        // The ABI decoder accepts any 256-bit word, so widths are enforced here
        let narrow = |idx: usize, name: &str, max: u32| -> OrchestratorResult<u32> {
            let value = uint(idx)?;
            if value > U256::from(max) {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "hook calldata {} {} exceeds {}",
                    name, value, max
                )));
            }
            Ok(value.low_u32())
        };

        Ok(Some(Self {
            intent_type: narrow(0, "intent_type", u8::MAX as u32)? as u8,
            chain_id: narrow(1, "chain_id", u32::MAX)?,
            token_id: narrow(2, "token_id", u16::MAX as u32)? as u16,
            worker_id: narrow(3, "worker_id", u16::MAX as u32)? as u16,
            min_output_amount: uint(4)?,
        }))
    }

    pub fn encode(&self) -> Vec<u8> {
        abi::encode(&[
            Token::Uint(U256::from(self.intent_type)),
            Token::Uint(U256::from(self.chain_id)),
            Token::Uint(U256::from(self.token_id)),
            Token::Uint(U256::from(self.worker_id)),
            Token::Uint(self.min_output_amount),
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeTracking {
    pub bridge_type: String,
    pub submission_id: String,
    pub status: Option<String>,
    pub error: Option<String>,
    pub expected_arrival_at: Option<DateTime<Utc>>,
}

/// Retry bookkeeping for one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRetry {
    pub count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl StageRetry {
    pub fn bump(&mut self) {
        self.count += 1;
        self.last_retry_at = Some(Utc::now());
    }
}

/// Direct treasury transfer used when the payout worker cannot deliver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackState {
    pub transferred: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub retry: StageRetry,
}

/// One redemption intent, moving through proof, execute, payout and hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: Uuid,
    pub owner: String,
    pub beneficiary: String,
    pub intent_type: IntentType,
    /// Token address for raw tokens, asset id for wrapped assets
    pub token: String,
    #[serde(with = "super::decimal")]
    pub amount: U256,
    pub allocation_ids: Vec<Uuid>,
    pub route: RouteConstraints,
    pub fee_rate_bps: Option<u32>,
    pub status: RequestStatus,

    pub proof_status: ProofStatus,
    pub proof: Option<String>,
    pub public_values: Option<String>,
    pub proof_generated_at: Option<DateTime<Utc>>,
    pub proof_error: Option<String>,
    pub proof_retry: StageRetry,

    pub execute_status: ExecuteStatus,
    pub execute_chain_id: u64,
    pub execute_tx_hash: Option<String>,
    pub execute_block: Option<u64>,
    pub executed_at: Option<DateTime<Utc>>,
    pub execute_error: Option<String>,
    pub execute_retry: StageRetry,

    pub payout_status: PayoutStatus,
    pub target_chain_id: u64,
    pub payout_chain_id: Option<u64>,
    pub payout_tx_hash: Option<String>,
    pub payout_block: Option<u64>,
    pub payout_completed_at: Option<DateTime<Utc>>,
    pub payout_error: Option<String>,
    pub payout_retry: StageRetry,
    pub worker_type: WorkerType,
    pub worker_params: serde_json::Value,
    #[serde(default, with = "super::decimal::option")]
    pub actual_output: Option<U256>,
    pub cross_chain: bool,
    pub bridge: Option<BridgeTracking>,
    pub fallback: FallbackState,

    pub hook_status: HookStatus,
    pub hook_calldata: Option<HookCalldata>,
    pub hook_tx_hash: Option<String>,
    pub hook_completed_at: Option<DateTime<Utc>>,
    pub hook_error: Option<String>,
    pub hook_retry: StageRetry,

    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: String,
        beneficiary: String,
        intent_type: IntentType,
        token: String,
        amount: U256,
        allocation_ids: Vec<Uuid>,
        execute_chain_id: u64,
        target_chain_id: u64,
        worker_type: WorkerType,
        worker_params: serde_json::Value,
        route: RouteConstraints,
        hook_calldata: Option<HookCalldata>,
    ) -> Self {
        let now = Utc::now();
        let hook_status = if hook_calldata.is_some() {
            HookStatus::Pending
        } else {
            HookStatus::NotRequired
        };

        Self {
            id: Uuid::new_v4(),
            owner,
            beneficiary,
            intent_type,
            token,
            amount,
            allocation_ids,
            route,
            fee_rate_bps: None,
            status: RequestStatus::Created,
            proof_status: ProofStatus::Pending,
            proof: None,
            public_values: None,
            proof_generated_at: None,
            proof_error: None,
            proof_retry: StageRetry::default(),
            execute_status: ExecuteStatus::Pending,
            execute_chain_id,
            execute_tx_hash: None,
            execute_block: None,
            executed_at: None,
            execute_error: None,
            execute_retry: StageRetry::default(),
            payout_status: PayoutStatus::Pending,
            target_chain_id,
            payout_chain_id: None,
            payout_tx_hash: None,
            payout_block: None,
            payout_completed_at: None,
            payout_error: None,
            payout_retry: StageRetry::default(),
            worker_type,
            worker_params,
            actual_output: None,
            cross_chain: false,
            bridge: None,
            fallback: FallbackState::default(),
            hook_status,
            hook_calldata,
            hook_tx_hash: None,
            hook_completed_at: None,
            hook_error: None,
            hook_retry: StageRetry::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn hook_required(&self) -> bool {
        self.hook_status != HookStatus::NotRequired
    }

    /// Recompute the summary status from the stage statuses
    pub fn refresh_status(&mut self) {
        if self.status == RequestStatus::Cancelled {
            return;
        }

        self.status = match (
            self.proof_status,
            self.execute_status,
            self.payout_status,
            self.hook_status,
        ) {
            (ProofStatus::Pending, ..) => RequestStatus::Created,
            (ProofStatus::InProgress, ..) => RequestStatus::Proving,
            (ProofStatus::Failed, ..) => RequestStatus::ProofFailed,
            (ProofStatus::Completed, ExecuteStatus::Pending, ..) => RequestStatus::ProofGenerated,
            (_, ExecuteStatus::Failed, ..) => RequestStatus::SubmitFailed,
            (_, ExecuteStatus::Submitted, ..) => RequestStatus::Submitting,
            (_, ExecuteStatus::Success, PayoutStatus::Pending, _) => RequestStatus::WaitingForPayout,
            (_, ExecuteStatus::Success, PayoutStatus::Processing, _) => RequestStatus::PayoutProcessing,
            (_, ExecuteStatus::Success, PayoutStatus::Failed, _) => RequestStatus::PayoutFailed,
            (_, ExecuteStatus::Success, PayoutStatus::Completed, hook) => match hook {
                HookStatus::NotRequired | HookStatus::Completed => RequestStatus::Completed,
                HookStatus::Pending | HookStatus::Processing => RequestStatus::HookProcessing,
                HookStatus::Failed => RequestStatus::HookFailed,
            },
        };
    }

    /// Cancellation is refused once the execute transaction may have consumed nullifiers
    pub fn can_cancel(&self) -> bool {
        self.status != RequestStatus::Cancelled
            && !matches!(
                self.execute_status,
                ExecuteStatus::Submitted | ExecuteStatus::Success
            )
    }

    /// Finished requests are never written again
    pub fn is_settled(&self) -> bool {
        self.payout_status == PayoutStatus::Completed
            && matches!(self.hook_status, HookStatus::Completed | HookStatus::NotRequired)
    }

    /// Drop proof output and every downstream attempt that depended on it.
    /// Only valid before the execute transaction has been sent.
    pub fn reset_for_restart(&mut self) {
        self.proof_status = ProofStatus::Pending;
        self.proof = None;
        self.public_values = None;
        self.proof_generated_at = None;
        self.proof_error = None;

        self.execute_status = ExecuteStatus::Pending;
        self.execute_tx_hash = None;
        self.execute_block = None;
        self.executed_at = None;
        self.execute_error = None;

        self.payout_status = PayoutStatus::Pending;
        self.payout_chain_id = None;
        self.payout_tx_hash = None;
        self.payout_block = None;
        self.payout_completed_at = None;
        self.payout_error = None;
        self.actual_output = None;
        self.cross_chain = false;
        self.bridge = None;
        self.fallback = FallbackState {
            retry: self.fallback.retry.clone(),
            ..FallbackState::default()
        };

        self.hook_status = if self.hook_calldata.is_some() {
            HookStatus::Pending
        } else {
            HookStatus::NotRequired
        };
        self.hook_tx_hash = None;
        self.hook_completed_at = None;
        self.hook_error = None;

        self.refresh_status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(hook: Option<HookCalldata>) -> WithdrawRequest {
        WithdrawRequest::new(
            "0xowner".into(),
            "0xbeneficiary".into(),
            IntentType::RawToken,
            "0xtoken".into(),
            U256::from(1_000u64),
            vec![Uuid::new_v4()],
            56,
            1,
            WorkerType::DirectTransfer,
            serde_json::json!({}),
            RouteConstraints::default(),
            hook,
        )
    }

    #[test]
    fn hook_status_follows_calldata() {
        assert_eq!(request(None).hook_status, HookStatus::NotRequired);
        let hook = HookCalldata {
            intent_type: 1,
            chain_id: 714,
            token_id: 3,
            worker_id: 2,
            min_output_amount: U256::from(5u64),
        };
        assert_eq!(request(Some(hook)).hook_status, HookStatus::Pending);
    }

    #[test]
    fn hook_calldata_decodes_event_payload() {
        let hook = HookCalldata {
            intent_type: 1,
            chain_id: 60,
            token_id: 7,
            worker_id: 2,
            min_output_amount: U256::from(123_456u64),
        };
        let decoded = HookCalldata::decode(&hook.encode()).unwrap();
        assert_eq!(decoded, Some(hook));
        assert_eq!(HookCalldata::decode(&[]).unwrap(), None);
        assert!(HookCalldata::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn hook_calldata_rejects_oversized_fields() {
        let words = |intent: u64, chain: u64, token: u64, worker: u64| {
            abi::encode(&[
                Token::Uint(U256::from(intent)),
                Token::Uint(U256::from(chain)),
                Token::Uint(U256::from(token)),
                Token::Uint(U256::from(worker)),
                Token::Uint(U256::from(1u64)),
            ])
        };

        let err = HookCalldata::decode(&words(256, 1, 1, 1)).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(err.to_string().contains("intent_type"));
        assert!(HookCalldata::decode(&words(1, 1u64 << 32, 1, 1)).is_err());
        assert!(HookCalldata::decode(&words(1, 1, 65_536, 1)).is_err());
        assert!(HookCalldata::decode(&words(1, 1, 1, 70_000)).is_err());

        let edge = HookCalldata::decode(&words(255, u32::MAX as u64, 65_535, 65_535))
            .unwrap()
            .unwrap();
        assert_eq!(edge.intent_type, 255);
        assert_eq!(edge.chain_id, u32::MAX);
        assert_eq!(edge.token_id, 65_535);
    }

    #[test]
    fn summary_status_tracks_stages() {
        let mut req = request(None);
        req.proof_status = ProofStatus::Completed;
        req.execute_status = ExecuteStatus::Failed;
        req.payout_status = PayoutStatus::Processing;
        req.refresh_status();
        assert_eq!(req.status, RequestStatus::SubmitFailed);

        req.execute_status = ExecuteStatus::Success;
        req.payout_status = PayoutStatus::Completed;
        req.refresh_status();
        assert_eq!(req.status, RequestStatus::Completed);
        assert!(req.is_settled());
    }

    #[test]
    fn cancelled_is_sticky() {
        let mut req = request(None);
        req.status = RequestStatus::Cancelled;
        req.proof_status = ProofStatus::Completed;
        req.refresh_status();
        assert_eq!(req.status, RequestStatus::Cancelled);
        assert!(!req.can_cancel());
    }

    #[test]
    fn restart_clears_every_stage() {
        let hook = HookCalldata {
            intent_type: 1,
            chain_id: 1,
            token_id: 3,
            worker_id: 2,
            min_output_amount: U256::from(5u64),
        };
        let mut req = request(Some(hook));
        req.proof_status = ProofStatus::Completed;
        req.proof = Some("0xproof".into());
        req.public_values = Some("0xpv".into());
        req.execute_status = ExecuteStatus::Failed;
        req.execute_tx_hash = Some("0xexec".into());
        req.payout_status = PayoutStatus::Processing;
        req.payout_tx_hash = Some("0xpayout".into());
        req.fallback.tx_hash = Some("0xfallback".into());
        req.fallback.retry.count = 2;
        req.hook_status = HookStatus::Failed;
        req.hook_error = Some("reverted".into());

        req.reset_for_restart();
        assert_eq!(req.proof_status, ProofStatus::Pending);
        assert!(req.proof.is_none() && req.public_values.is_none());
        assert_eq!(req.execute_status, ExecuteStatus::Pending);
        assert!(req.execute_tx_hash.is_none());
        assert_eq!(req.payout_status, PayoutStatus::Pending);
        assert!(req.payout_tx_hash.is_none());
        assert!(req.fallback.tx_hash.is_none());
        assert_eq!(req.fallback.retry.count, 2);
        assert_eq!(req.hook_status, HookStatus::Pending);
        assert!(req.hook_error.is_none());
        assert_eq!(req.status, RequestStatus::Created);

        let mut plain = request(None);
        plain.hook_status = HookStatus::Completed;
        plain.reset_for_restart();
        assert_eq!(plain.hook_status, HookStatus::NotRequired);
    }

    #[test]
    fn slippage_bound_is_checked() {
        let route = RouteConstraints {
            max_slippage_bps: Some(10_001),
            ..Default::default()
        };
        assert!(route.validate().is_err());
    }
}
