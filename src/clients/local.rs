//! In-process fee oracle and notifier

use crate::collaborators::{FeeOracle, Notifier, StatusEvent};
use crate::error::OrchestratorResult;

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::info;

/// Fee rates from configuration, with optional per-chain overrides
pub struct StaticFeeOracle {
    default_bps: u32,
    per_chain: HashMap<u64, u32>,
}

impl StaticFeeOracle {
    pub fn new(default_bps: u32) -> Self {
        Self {
            default_bps,
            per_chain: HashMap::new(),
        }
    }

    pub fn with_chain_rate(mut self, chain_id: u64, bps: u32) -> Self {
        self.per_chain.insert(chain_id, bps);
        self
    }
}

#[async_trait]
impl FeeOracle for StaticFeeOracle {
    async fn fee_rate_bps(&self, chain_id: u64, _address: &str, _token: &str) -> OrchestratorResult<u32> {
        Ok(self.per_chain.get(&chain_id).copied().unwrap_or(self.default_bps))
    }
}

/// Writes status events to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: StatusEvent) -> OrchestratorResult<()> {
        info!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            status = %event.status,
            message = event.message.as_deref().unwrap_or(""),
            "Status changed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chain_override_wins_over_default() {
        let oracle = StaticFeeOracle::new(30).with_chain_rate(56, 10);
        assert_eq!(oracle.fee_rate_bps(56, "0xabc", "0xusdt").await.unwrap(), 10);
        assert_eq!(oracle.fee_rate_bps(1, "0xabc", "0xusdt").await.unwrap(), 30);
    }
}
