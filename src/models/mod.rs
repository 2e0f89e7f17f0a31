//! Persisted entity models
//!
//! Amounts are wei values carried as `U256` and serialized as decimal strings.

mod checkbook;
mod multisig;
mod polling;
mod withdraw;

pub use checkbook::{Allocation, Checkbook};
pub use multisig::{
    ExecutionReport, MultisigExecution, MultisigProposal, MultisigRejection, MultisigSignature,
    NewProposal,
};
pub use polling::{PollingRequest, PollingTask};
pub use withdraw::{
    BridgeTracking, FallbackState, HookCalldata, RouteConstraints, StageRetry, WithdrawRequest,
    WorkerType,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use ethers::types::U256;

/// Parse a decimal wei amount
pub fn parse_amount(raw: &str) -> OrchestratorResult<U256> {
    U256::from_dec_str(raw.trim())
        .map_err(|e| OrchestratorError::InvalidArgument(format!("invalid amount '{}': {}", raw, e)))
}

/// Serde adapter writing `U256` as a decimal string
pub mod decimal {
    use ethers::types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_amount(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use ethers::types::U256;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<U256>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<U256>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::super::parse_amount(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
