//! Chain module - submits contract calls and reports transaction status
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Receipt-based status with chain-specific confirmation depth
//! - Nonce tracking and signed raw-transaction submission

pub mod finality;
mod nonce;
pub mod provider;
pub mod submit;

pub use finality::FinalityTracker;
pub use provider::ChainProvider;
pub use submit::TransactionSubmitter;

use crate::collaborators::{ChainClient, ContractCall, TxStatus};
use crate::config::Settings;
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::H256;
use std::sync::Arc;
use tracing::{info, warn};

const SETTLED_CACHE_LIMIT: usize = 10_000;

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain ID
    providers: DashMap<u64, Arc<ChainProvider>>,
    /// Finality trackers indexed by chain ID
    finality_trackers: DashMap<u64, Arc<FinalityTracker>>,
    /// Absent when no signing key is configured; status queries still work
    submitter: Option<TransactionSubmitter>,
}

impl ChainManager {
    /// Create a new chain manager with all configured chains
    pub fn new(settings: &Settings, submitter: Option<TransactionSubmitter>) -> OrchestratorResult<Self> {
        let providers = DashMap::new();
        let finality_trackers = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );

            let provider = Arc::new(ChainProvider::new(chain_config.clone())?);
            providers.insert(chain_config.chain_id, provider.clone());

            let finality = FinalityTracker::new(
                chain_config.chain_id,
                chain_config.confirmation_blocks,
                provider,
            );
            finality_trackers.insert(chain_config.chain_id, Arc::new(finality));
        }

        if submitter.is_none() {
            warn!("No signing key configured - chain submissions are disabled");
        }

        Ok(Self {
            providers,
            finality_trackers,
            submitter,
        })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u64) -> OrchestratorResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or_else(|| OrchestratorError::Chain {
                chain_id,
                message: "chain not configured".to_string(),
            })
    }

    fn get_finality_tracker(&self, chain_id: u64) -> OrchestratorResult<Arc<FinalityTracker>> {
        self.finality_trackers
            .get(&chain_id)
            .map(|f| f.clone())
            .ok_or_else(|| OrchestratorError::Chain {
                chain_id,
                message: "chain not configured".to_string(),
            })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let providers: Vec<_> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (chain_id, provider) in providers {
            let healthy = provider.health_check().await;
            results.push((chain_id, healthy));
            crate::metrics::record_chain_health(chain_id, healthy);
        }

        let trackers: Vec<_> = self.finality_trackers.iter().map(|e| e.value().clone()).collect();
        for tracker in trackers {
            tracker.cleanup_cache(SETTLED_CACHE_LIMIT).await;
        }

        results
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        self.providers.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl ChainClient for ChainManager {
    async fn submit(&self, chain_id: u64, call: ContractCall) -> OrchestratorResult<String> {
        let submitter = self.submitter.as_ref().ok_or_else(|| {
            OrchestratorError::NotImplemented("chain submission without a signing key".to_string())
        })?;
        let provider = self.get_provider(chain_id)?;

        let tx_hash = submitter.submit(&provider, &call).await?;
        crate::metrics::record_tx_submitted(chain_id, call.name());
        Ok(format!("{:?}", tx_hash))
    }

    async fn get_tx_status(&self, chain_id: u64, tx_hash: &str) -> OrchestratorResult<TxStatus> {
        let hash: H256 = tx_hash.parse().map_err(|e| {
            OrchestratorError::InvalidArgument(format!("invalid tx hash '{}': {}", tx_hash, e))
        })?;
        self.get_finality_tracker(chain_id)?.tx_status(hash).await
    }
}
