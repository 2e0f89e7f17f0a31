//! zkpay orchestrator service
//!
//! Runs the polling scheduler, the orchestrator engine, the multisig expiry
//! sweep and the HTTP API against one shared store.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use zkpay_orchestrator::api::{self, AppState};
use zkpay_orchestrator::chain::{ChainManager, TransactionSubmitter};
use zkpay_orchestrator::clients::{HttpPayoutWorker, HttpProofGenerator, LogNotifier, StaticFeeOracle};
use zkpay_orchestrator::config::Settings;
use zkpay_orchestrator::metrics::{self, MetricsServer};
use zkpay_orchestrator::multisig::MultisigTracker;
use zkpay_orchestrator::orchestrator::{Collaborators, EntityReconciler, Orchestrator};
use zkpay_orchestrator::polling::{PollingQueue, PollingScheduler};
use zkpay_orchestrator::retry::RetryCoordinator;
use zkpay_orchestrator::store::{MemoryStore, PgStore, Store};

/// Buffered confirmation signals between scheduler and engine
const SIGNAL_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting zkpay orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let store: Arc<dyn Store> = if settings.database.is_memory() {
        warn!("Using the in-memory store - state is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        let pg = PgStore::new(&settings.database).await?;
        info!("Database connection established");
        pg.run_migrations().await?;
        info!("Database migrations complete");
        Arc::new(pg)
    };

    let submitter = match TransactionSubmitter::from_env() {
        Ok(submitter) => {
            info!("Submitting transactions as {:?}", submitter.address());
            Some(submitter)
        }
        Err(e) => {
            warn!("No transaction signer: {}", e);
            None
        }
    };
    let chain_manager = Arc::new(ChainManager::new(&settings, submitter)?);
    info!("Chain connections initialized: {:?}", chain_manager.connected_chains());

    let fees = settings
        .enabled_chains()
        .into_iter()
        .filter_map(|(_, chain)| chain.fee_bps.map(|bps| (chain.chain_id, bps)))
        .fold(
            StaticFeeOracle::new(settings.services.default_fee_bps),
            |oracle, (chain_id, bps)| oracle.with_chain_rate(chain_id, bps),
        );

    let timeout = settings.services.request_timeout_secs;
    let collaborators = Collaborators {
        proofs: Arc::new(HttpProofGenerator::new(&settings.services.proof_generator_url, timeout)?),
        chain: chain_manager.clone(),
        payouts: Arc::new(HttpPayoutWorker::new(&settings.services.payout_worker_url, timeout)?),
        fees: Arc::new(fees),
        notifier: Arc::new(LogNotifier),
    };

    let queue = Arc::new(PollingQueue::new(store.clone(), settings.polling.clone()));

    let multisig_addresses: HashMap<u64, String> = settings
        .enabled_chains()
        .into_iter()
        .filter_map(|(_, chain)| chain.multisig_address.clone().map(|addr| (chain.chain_id, addr)))
        .collect();
    let multisig = Arc::new(MultisigTracker::new(
        store.clone(),
        chain_manager.clone(),
        queue.clone(),
        settings.multisig.clone(),
        multisig_addresses,
        settings.orchestrator.instance_id.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        queue.clone(),
        collaborators,
        settings.orchestrator.clone(),
    ));
    let retry = Arc::new(RetryCoordinator::for_orchestrator(orchestrator.clone()));

    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
    let reconciler = Arc::new(EntityReconciler::new(orchestrator.clone(), Some(multisig.clone())));
    let scheduler = Arc::new(
        PollingScheduler::new(
            store.clone(),
            chain_manager.clone(),
            reconciler,
            settings.polling.clone(),
        )
        .with_signals(signal_tx),
    );

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            store: store.clone(),
            orchestrator: orchestrator.clone(),
            retry,
            queue: queue.clone(),
            multisig: multisig.clone(),
            chains: Some(chain_manager.clone()),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            if let Err(e) = scheduler.run().await {
                error!("Polling scheduler error: {}", e);
            }
        }
    });

    let engine_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            if let Err(e) = orchestrator.run(signal_rx).await {
                error!("Orchestrator engine error: {}", e);
            }
        }
    });

    let multisig_handle = tokio::spawn({
        let multisig = multisig.clone();
        async move {
            if let Err(e) = multisig.run().await {
                error!("Multisig sweep error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.orchestrator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, chain_ok) in chain_manager.health_check().await {
                    if !chain_ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                    healthy = false;
                }

                metrics::record_health_check(healthy);
            }
        }
    });

    info!("zkpay orchestrator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    scheduler.stop().await;
    orchestrator.stop().await;
    multisig.stop().await;

    api_handle.abort();
    scheduler_handle.abort();
    engine_handle.abort();
    multisig_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("zkpay orchestrator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,zkpay_orchestrator=debug,sqlx=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
