//! RPC access for one chain, rotating across endpoints when one stops answering

use crate::config::ChainConfig;
use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ChainProvider {
    config: ChainConfig,
    endpoints: Vec<Provider<Http>>,
    active: AtomicUsize,
}

impl ChainProvider {
    /// Unparseable RPC URLs are skipped; at least one must remain
    pub fn new(config: ChainConfig) -> OrchestratorResult<Self> {
        let endpoints: Vec<Provider<Http>> = config
            .rpc_urls
            .iter()
            .filter_map(|url| match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => Some(provider.interval(POLL_INTERVAL)),
                Err(e) => {
                    warn!(chain_id = config.chain_id, "Skipping RPC endpoint {}: {}", url, e);
                    None
                }
            })
            .collect();

        if endpoints.is_empty() {
            return Err(OrchestratorError::Chain {
                chain_id: config.chain_id,
                message: "no usable RPC endpoint".to_string(),
            });
        }
        debug!(chain_id = config.chain_id, "{} RPC endpoints configured", endpoints.len());

        Ok(Self {
            config,
            endpoints,
            active: AtomicUsize::new(0),
        })
    }

    fn active_index(&self) -> usize {
        self.active.load(Ordering::Relaxed) % self.endpoints.len()
    }

    /// Move past `failed` unless a concurrent caller already did
    fn rotate(&self, failed: usize) {
        let next = (failed + 1) % self.endpoints.len();
        if self
            .active
            .compare_exchange(failed, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            warn!(chain_id = self.config.chain_id, "Switched to RPC endpoint {}", next);
        }
    }

    fn chain_error(&self, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::Chain {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }

    /// Try each endpoint once, starting from the active one
    async fn with_failover<T, F, Fut>(&self, what: &str, call: F) -> OrchestratorResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;
        for _ in 0..self.endpoints.len() {
            let idx = self.active_index();
            match call(self.endpoints[idx].clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(chain_id = self.config.chain_id, endpoint = idx, "{} failed: {}", what, e);
                    last_error = Some(e);
                    self.rotate(idx);
                }
            }
        }
        Err(self.chain_error(match last_error {
            Some(e) => format!("{} failed on every endpoint: {}", what, e),
            None => format!("{} failed on every endpoint", what),
        }))
    }

    pub async fn get_block_number(&self) -> OrchestratorResult<u64> {
        self.with_failover("block number", |p| async move { p.get_block_number().await })
            .await
            .map(|block| block.as_u64())
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> OrchestratorResult<Option<TransactionReceipt>> {
        self.with_failover("receipt lookup", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Whether the node knows the transaction at all (mined or in the mempool)
    pub async fn has_transaction(&self, tx_hash: H256) -> OrchestratorResult<bool> {
        self.with_failover("transaction lookup", |p| async move { p.get_transaction(tx_hash).await })
            .await
            .map(|tx| tx.is_some())
    }

    /// Next nonce for an account, counting pending transactions
    pub async fn get_transaction_count(&self, address: Address) -> OrchestratorResult<u64> {
        self.with_failover("nonce lookup", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
    }

    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> OrchestratorResult<U256> {
        self.with_failover("gas estimation", |p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx, None).await }
        })
        .await
    }

    pub async fn get_gas_price(&self) -> OrchestratorResult<U256> {
        self.with_failover("gas price lookup", |p| async move { p.get_gas_price().await })
            .await
    }

    /// Broadcast on the active endpoint only; a failure rotates for the next send
    pub async fn send_raw_transaction(&self, raw: Bytes) -> OrchestratorResult<H256> {
        let idx = self.active_index();
        match self.endpoints[idx].send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                self.rotate(idx);
                Err(self.chain_error(e.to_string()))
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!(chain_id = self.config.chain_id, "Health check failed: {}", e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn settlement_address(&self) -> &str {
        &self.config.settlement_address
    }

    pub fn treasury_address(&self) -> &str {
        &self.config.treasury_address
    }
}
