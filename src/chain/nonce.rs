//! Nonce management for the orchestrator's signing account

use crate::chain::ChainProvider;
use crate::error::OrchestratorResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
struct ChainNonceState {
    /// Next nonce to use
    current: u64,
    /// Whether `current` was read from the chain
    synced: bool,
}

/// Hands out nonces per chain so concurrent submissions never collide
pub struct NonceManager {
    wallet_address: Address,
    chain_state: DashMap<u64, Arc<Mutex<ChainNonceState>>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    /// Allocate the next nonce, syncing from the chain on first use
    pub async fn next_nonce(&self, provider: &ChainProvider) -> OrchestratorResult<u64> {
        let chain_id = provider.chain_id();
        let entry = self
            .chain_state
            .entry(chain_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChainNonceState {
                    current: 0,
                    synced: false,
                }))
            })
            .clone();
        let mut state = entry.lock().await;

        if !state.synced {
            state.current = provider.get_transaction_count(self.wallet_address).await?;
            state.synced = true;
            debug!("Initialized nonce for chain {}: {}", chain_id, state.current);
        }

        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Give back a nonce whose transaction never reached the mempool
    pub async fn release(&self, chain_id: u64, nonce: u64) {
        let entry = self.chain_state.get(&chain_id).map(|e| e.clone());
        if let Some(entry) = entry {
            let mut state = entry.lock().await;
            if nonce + 1 == state.current {
                state.current = nonce;
            } else {
                // A later nonce is already out; force a re-read instead of leaving a gap
                state.synced = false;
            }
        }
    }

    /// Drop local state so the next allocation re-reads the chain
    pub async fn resync(&self, chain_id: u64) {
        let entry = self.chain_state.get(&chain_id).map(|e| e.clone());
        if let Some(entry) = entry {
            entry.lock().await.synced = false;
            warn!("Nonce for chain {} marked for resync", chain_id);
        }
    }
}
