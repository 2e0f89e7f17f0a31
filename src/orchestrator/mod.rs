//! Withdrawal and checkbook orchestration
//!
//! Sequences proof generation, on-chain submission, payout and hook calls for
//! each entity. Every hand-off to the chain ends in a polling task; the
//! scheduler reports results back through `EntityReconciler` and the signal
//! channel consumed by `run`.

mod checkbook;
mod reconciler;
mod withdraw;

pub use reconciler::EntityReconciler;
pub use withdraw::CreateWithdrawRequest;

use crate::collaborators::{
    notify_detached, ChainClient, FeeOracle, Notifier, PayoutWorker, ProofGenerator, StatusEvent,
};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{Checkbook, PollingRequest, WithdrawRequest};
use crate::polling::{PollOutcome, PollSignal, PollingQueue};
use crate::status::{CheckbookStatus, EntityType, ExecuteStatus, TaskType};
use crate::store::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Requests resumed per recovery sweep
const RESUME_BATCH: usize = 50;

/// External systems the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub proofs: Arc<dyn ProofGenerator>,
    pub chain: Arc<dyn ChainClient>,
    pub payouts: Arc<dyn PayoutWorker>,
    pub fees: Arc<dyn FeeOracle>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    queue: Arc<PollingQueue>,
    proofs: Arc<dyn ProofGenerator>,
    chain: Arc<dyn ChainClient>,
    payouts: Arc<dyn PayoutWorker>,
    fees: Arc<dyn FeeOracle>,
    notifier: Arc<dyn Notifier>,
    config: OrchestratorConfig,
    shutdown: Arc<RwLock<bool>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<PollingQueue>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            proofs: collaborators.proofs,
            chain: collaborators.chain,
            payouts: collaborators.payouts,
            fees: collaborators.fees,
            notifier: collaborators.notifier,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn get_checkbook(&self, id: Uuid) -> OrchestratorResult<Checkbook> {
        self.store
            .get_checkbook(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("checkbook", id))
    }

    pub async fn get_withdraw_request(&self, id: Uuid) -> OrchestratorResult<WithdrawRequest> {
        self.store
            .get_withdraw_request(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("withdraw request", id))
    }

    async fn save_checkbook(&self, checkbook: &mut Checkbook) -> OrchestratorResult<()> {
        self.store.update_checkbook(checkbook).await?;
        crate::metrics::record_stage_transition("checkbook", checkbook.status.as_str());
        Ok(())
    }

    /// Persist a request with its summary status recomputed
    async fn save_request(&self, request: &mut WithdrawRequest, stage: &str) -> OrchestratorResult<()> {
        request.refresh_status();
        self.store.update_withdraw_request(request).await?;
        crate::metrics::record_stage_transition(stage, request.status.as_str());
        Ok(())
    }

    fn notify_checkbook(&self, checkbook: &Checkbook) {
        let mut event = StatusEvent::new(EntityType::Checkbook, checkbook.id, checkbook.status);
        if let Some(reason) = checkbook.last_error.as_ref().filter(|_| checkbook.status.is_failure()) {
            event = event.with_message(reason.clone());
        }
        notify_detached(&self.notifier, event);
    }

    fn notify_request(&self, request: &WithdrawRequest) {
        notify_detached(
            &self.notifier,
            StatusEvent::new(EntityType::WithdrawRequest, request.id, request.status),
        );
    }

    /// Hand a submitted transaction to the polling scheduler. A task that is
    /// already active for the stage keeps running.
    async fn track(&self, request: PollingRequest) -> OrchestratorResult<()> {
        let entity_id = request.entity_id;
        let task_type = request.task_type;
        match self.queue.enqueue(request).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::AlreadyActive { .. }) => {
                warn!(entity_id = %entity_id, task_type = %task_type, "Polling task already active");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Engine loop: starts follow-up stages on confirmations and runs the
    /// proof timeout, payout and tracking recovery sweeps.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<PollSignal>) -> OrchestratorResult<()> {
        let mut sweep_interval = interval(Duration::from_secs(self.config.sweep_interval_secs));

        info!(
            "Orchestrator engine started (proof timeout {}s, sweep every {}s)",
            self.config.proof_timeout_secs, self.config.sweep_interval_secs
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                Some(signal) = signals.recv() => {
                    self.handle_signal(signal);
                }

                _ = sweep_interval.tick() => {
                    if let Err(e) = self.sweep_stale_proofs().await {
                        error!("Proof timeout sweep failed: {}", e);
                    }
                    if let Err(e) = self.resume_awaiting_payout().await {
                        error!("Payout recovery sweep failed: {}", e);
                    }
                    if let Err(e) = self.recover_untracked().await {
                        error!("Tracking recovery sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Orchestrator engine stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Start the next withdrawal stage once the previous one is confirmed
    fn handle_signal(self: &Arc<Self>, signal: PollSignal) {
        match (&signal.task_type, &signal.outcome) {
            (TaskType::WithdrawExecute | TaskType::WithdrawPayout, PollOutcome::Confirmed { .. }) => {
                let orchestrator = self.clone();
                let id = signal.entity_id;
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.advance(id).await {
                        if e.is_concurrent_modification() {
                            debug!(request_id = %id, "Stage already picked up elsewhere");
                        } else {
                            error!(request_id = %id, "Next stage failed: {}", e);
                        }
                    }
                });
            }
            (_, PollOutcome::Failed { reason }) => {
                warn!(
                    entity_id = %signal.entity_id,
                    task_type = %signal.task_type,
                    "Polling ended in failure: {}",
                    reason
                );
            }
            _ => {
                debug!(
                    entity_id = %signal.entity_id,
                    task_type = %signal.task_type,
                    "Polling confirmed"
                );
            }
        }
    }

    /// Resume requests whose execute succeeded but whose payout never started
    pub async fn resume_awaiting_payout(&self) -> OrchestratorResult<usize> {
        let waiting = self.store.list_awaiting_payout(RESUME_BATCH).await?;
        let mut resumed = 0;
        for request in waiting {
            match self.advance(request.id).await {
                Ok(_) => resumed += 1,
                Err(e) if e.is_concurrent_modification() => {
                    debug!(request_id = %request.id, "Payout already picked up");
                }
                Err(e) => warn!(request_id = %request.id, "Could not resume payout: {}", e),
            }
        }
        if resumed > 0 {
            info!("Resumed {} requests waiting for payout", resumed);
        }
        Ok(resumed)
    }

    /// Re-attach polling to submitted transactions that lost their task.
    ///
    /// Entities touched within the last sweep interval are skipped so an
    /// in-flight submission is never raced. An execute that was claimed but
    /// never got a transaction hash is failed so it can be retried.
    pub async fn recover_untracked(&self) -> OrchestratorResult<usize> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.sweep_interval_secs as i64);
        let mut recovered = 0;

        for checkbook in self.store.list_untracked_commitments(RESUME_BATCH).await? {
            if checkbook.updated_at > cutoff {
                continue;
            }
            let Some(tx_hash) = checkbook.commitment_tx_hash.clone() else {
                warn!(checkbook_id = %checkbook.id, "Pending commitment has no transaction hash");
                continue;
            };
            let request = PollingRequest::new(
                TaskType::CommitmentConfirmation,
                checkbook.id,
                checkbook.chain_id,
                tx_hash,
                CheckbookStatus::CommitmentPending,
                CheckbookStatus::WithCheckbook,
            );
            if self.reattach(request).await {
                recovered += 1;
            }
        }

        for mut request in self.store.list_untracked_executes(RESUME_BATCH).await? {
            if request.updated_at > cutoff {
                continue;
            }
            let Some(tx_hash) = request.execute_tx_hash.clone() else {
                request.execute_status = ExecuteStatus::Failed;
                request.execute_error = Some("execute submission was interrupted".to_string());
                match self.save_request(&mut request, "execute").await {
                    Ok(()) => {
                        warn!(request_id = %request.id, "Interrupted execute marked failed");
                        self.notify_request(&request);
                        recovered += 1;
                    }
                    Err(e) if e.is_concurrent_modification() => {
                        debug!(request_id = %request.id, "Execute moved on while sweeping");
                    }
                    Err(e) => warn!(request_id = %request.id, "Could not fail interrupted execute: {}", e),
                }
                continue;
            };
            let polling = PollingRequest::new(
                TaskType::WithdrawExecute,
                request.id,
                request.execute_chain_id,
                tx_hash,
                ExecuteStatus::Submitted,
                ExecuteStatus::Success,
            );
            if self.reattach(polling).await {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("Recovered {} untracked submissions", recovered);
        }
        Ok(recovered)
    }

    async fn reattach(&self, request: PollingRequest) -> bool {
        let entity_id = request.entity_id;
        let task_type = request.task_type;
        match self.queue.enqueue(request).await {
            Ok(task_id) => {
                info!(entity_id = %entity_id, task_id = %task_id, "Polling re-attached for {}", task_type);
                true
            }
            Err(OrchestratorError::AlreadyActive { .. }) => false,
            Err(e) => {
                warn!(entity_id = %entity_id, "Could not re-attach {} polling: {}", task_type, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::collaborators::{
        MockChainClient, MockFeeOracle, MockNotifier, MockPayoutWorker, MockProofGenerator,
    };
    use crate::config::PollingConfig;
    use crate::store::MemoryStore;

    /// Mocks handed to `harness`; unset expectations accept nothing
    pub struct Mocks {
        pub proofs: MockProofGenerator,
        pub chain: MockChainClient,
        pub payouts: MockPayoutWorker,
        pub fees: MockFeeOracle,
    }

    impl Mocks {
        pub fn new() -> Self {
            let mut fees = MockFeeOracle::new();
            fees.expect_fee_rate_bps().returning(|_, _, _| Ok(30));
            Self {
                proofs: MockProofGenerator::new(),
                chain: MockChainClient::new(),
                payouts: MockPayoutWorker::new(),
                fees,
            }
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub queue: Arc<PollingQueue>,
        pub orchestrator: Arc<Orchestrator>,
    }

    pub fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            instance_id: "test".to_string(),
            proof_timeout_secs: 300,
            sweep_interval_secs: 30,
            stage_retry_limit: 3,
            health_check_interval_secs: 30,
        }
    }

    pub fn harness(mocks: Mocks) -> Harness {
        harness_with(mocks, test_config())
    }

    pub fn harness_with(mocks: Mocks, config: OrchestratorConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(PollingQueue::new(store.clone(), PollingConfig::default()));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(|_| Ok(()));

        let collaborators = Collaborators {
            proofs: Arc::new(mocks.proofs),
            chain: Arc::new(mocks.chain),
            payouts: Arc::new(mocks.payouts),
            fees: Arc::new(mocks.fees),
            notifier: Arc::new(notifier),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queue.clone(),
            collaborators,
            config,
        ));
        Harness {
            store,
            queue,
            orchestrator,
        }
    }
}
