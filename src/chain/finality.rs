//! Receipt-based transaction status with per-chain confirmation depth

use crate::chain::ChainProvider;
use crate::collaborators::{TxState, TxStatus};
use crate::error::OrchestratorResult;

use ethers::types::{H256, U64};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tracks finality for transactions on a specific chain
pub struct FinalityTracker {
    chain_id: u64,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    provider: Arc<ChainProvider>,
    /// Settled outcomes, so a confirmed or reverted tx is not re-read
    settled: RwLock<HashMap<H256, TxStatus>>,
}

impl FinalityTracker {
    pub fn new(chain_id: u64, confirmation_blocks: u64, provider: Arc<ChainProvider>) -> Self {
        let confirmation_blocks = if confirmation_blocks == 0 {
            recommended_confirmations(chain_id)
        } else {
            confirmation_blocks
        };

        Self {
            chain_id,
            confirmation_blocks,
            provider,
            settled: RwLock::new(HashMap::new()),
        }
    }

    /// Current status of a transaction.
    ///
    /// Unknown and unmined transactions are pending; the caller's retry budget
    /// decides when to give up on them. A receipt is confirmed only once it is
    /// `confirmation_blocks` deep.
    pub async fn tx_status(&self, tx_hash: H256) -> OrchestratorResult<TxStatus> {
        if let Some(status) = self.settled.read().await.get(&tx_hash) {
            return Ok(status.clone());
        }

        let receipt = match self.provider.get_transaction_receipt(tx_hash).await? {
            Some(receipt) => receipt,
            None => {
                if !self.provider.has_transaction(tx_hash).await? {
                    debug!("Transaction {:?} unknown on chain {}", tx_hash, self.chain_id);
                }
                return Ok(TxStatus::pending());
            }
        };

        let block_number = match receipt.block_number {
            Some(block) => block.as_u64(),
            None => return Ok(TxStatus::pending()),
        };
        let gas_used = receipt.gas_used.map(|g| g.as_u64());

        if receipt.status == Some(U64::zero()) {
            warn!(
                "Transaction {:?} reverted on chain {} in block {}",
                tx_hash, self.chain_id, block_number
            );
            let status = TxStatus {
                state: TxState::Failed,
                block_number: Some(block_number),
                gas_used,
                error_reason: Some("execution reverted".to_string()),
            };
            self.settled.write().await.insert(tx_hash, status.clone());
            return Ok(status);
        }

        let current_block = self.provider.get_block_number().await?;
        let confirmations = current_block.saturating_sub(block_number);
        if confirmations < self.confirmation_blocks {
            debug!(
                "Transaction {:?} has {} / {} confirmations on chain {}",
                tx_hash, confirmations, self.confirmation_blocks, self.chain_id
            );
            return Ok(TxStatus::pending());
        }

        info!(
            "Transaction {:?} finalized on chain {} ({} confirmations)",
            tx_hash, self.chain_id, confirmations
        );
        let status = TxStatus {
            state: TxState::Confirmed,
            block_number: Some(block_number),
            gas_used,
            error_reason: None,
        };
        self.settled.write().await.insert(tx_hash, status.clone());
        Ok(status)
    }

    /// Clear old settled cache entries (call periodically)
    pub async fn cleanup_cache(&self, max_entries: usize) {
        let mut settled = self.settled.write().await;
        if settled.len() > max_entries {
            let to_remove: Vec<_> = settled.keys().take(settled.len() / 2).cloned().collect();
            for k in to_remove {
                settled.remove(&k);
            }
        }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // BSC
        56 | 97 => 15,
        // Polygon mainnet
        137 => 128,
        // Arbitrum, Optimism, Base
        42161 | 10 | 8453 => 64,
        // Default conservative
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_depth_uses_chain_default() {
        assert_eq!(recommended_confirmations(56), 15);
        assert_eq!(recommended_confirmations(999_999), 64);
    }
}
