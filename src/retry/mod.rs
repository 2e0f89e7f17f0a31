//! Retry-from-failure coordination
//!
//! Each retryable entity type registers a `RetryTarget`. The coordinator
//! works out which stage to resume from and hands the work to the target.

mod targets;

pub use targets::{AllocationRetry, CheckbookRetry, WithdrawRetry};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::Orchestrator;
use crate::status::{EntityType, RetryStep};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What the coordinator needs to know about an entity before retrying it
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub status: String,
    /// Stage a failure status resumes from
    pub failed_step: Option<RetryStep>,
    /// First substantive stage, used by forced restarts
    pub first_step: RetryStep,
    pub can_retry: bool,
    pub user_message: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryTarget: Send + Sync {
    async fn snapshot(&self, id: Uuid) -> OrchestratorResult<EntitySnapshot>;

    /// Clear stage artifacts and run again from the first stage
    async fn restart(&self, id: Uuid) -> OrchestratorResult<RetryStep>;

    async fn dispatch(&self, id: Uuid, step: RetryStep) -> OrchestratorResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub success: bool,
    pub message: String,
    pub retry_started: bool,
    pub from_step: Option<RetryStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryOption {
    pub step: RetryStep,
    pub label: &'static str,
}

impl From<RetryStep> for RetryOption {
    fn from(step: RetryStep) -> Self {
        Self {
            step,
            label: step.label(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryOptions {
    pub from_current: RetryOption,
    pub from_beginning: RetryOption,
}

/// User-facing retry status of one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStatusView {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub status: String,
    pub user_message: String,
    pub can_retry: bool,
    pub retry_options: Option<RetryOptions>,
}

pub struct RetryCoordinator {
    targets: HashMap<EntityType, Arc<dyn RetryTarget>>,
}

impl RetryCoordinator {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
        }
    }

    /// Coordinator over the orchestrator's checkbooks, allocations and withdraw requests
    pub fn for_orchestrator(orchestrator: Arc<Orchestrator>) -> Self {
        Self::new()
            .register(EntityType::Checkbook, Arc::new(CheckbookRetry::new(orchestrator.clone())))
            .register(EntityType::Allocation, Arc::new(AllocationRetry::new(orchestrator.clone())))
            .register(EntityType::WithdrawRequest, Arc::new(WithdrawRetry::new(orchestrator)))
    }

    pub fn register(mut self, entity_type: EntityType, target: Arc<dyn RetryTarget>) -> Self {
        self.targets.insert(entity_type, target);
        self
    }

    fn target(&self, entity_type: &str) -> OrchestratorResult<(EntityType, Arc<dyn RetryTarget>)> {
        let parsed: EntityType = entity_type.parse()?;
        self.targets
            .get(&parsed)
            .map(|target| (parsed, target.clone()))
            .ok_or_else(|| {
                OrchestratorError::InvalidArgument(format!("retry is not supported for {}", entity_type))
            })
    }

    /// Resume an entity. `from_step` overrides inference; `force_restart`
    /// discards stage artifacts and starts over from the first stage.
    pub async fn retry(
        &self,
        entity_type: &str,
        id: Uuid,
        from_step: Option<RetryStep>,
        force_restart: bool,
    ) -> OrchestratorResult<RetryOutcome> {
        let (parsed, target) = self.target(entity_type)?;

        let result = match self.attempt(&target, id, from_step, force_restart).await {
            Err(e) if e.is_concurrent_modification() => {
                warn!(entity_type = %parsed, entity_id = %id, "Retry raced another update, trying once more");
                self.attempt(&target, id, from_step, force_restart).await
            }
            other => other,
        };

        let outcome = match &result {
            Ok(outcome) if outcome.retry_started => "started",
            Ok(_) => "noop",
            Err(_) => "failed",
        };
        crate::metrics::record_retry(parsed.as_str(), outcome);

        if let Ok(outcome) = &result {
            info!(
                entity_type = %parsed,
                entity_id = %id,
                started = outcome.retry_started,
                "{}",
                outcome.message
            );
        }
        result
    }

    async fn attempt(
        &self,
        target: &Arc<dyn RetryTarget>,
        id: Uuid,
        from_step: Option<RetryStep>,
        force_restart: bool,
    ) -> OrchestratorResult<RetryOutcome> {
        let snapshot = target.snapshot(id).await?;

        if force_restart {
            let step = target
                .restart(id)
                .await
                .map_err(|e| e.in_stage(snapshot.first_step))?;
            return Ok(RetryOutcome {
                success: true,
                message: format!("Restarted from {}", step),
                retry_started: true,
                from_step: Some(step),
            });
        }

        let Some(step) = from_step.or(snapshot.failed_step) else {
            return Ok(RetryOutcome {
                success: true,
                message: format!("Status is {}, nothing to retry", snapshot.status),
                retry_started: false,
                from_step: None,
            });
        };

        target
            .dispatch(id, step)
            .await
            .map_err(|e| e.in_stage(step))?;
        Ok(RetryOutcome {
            success: true,
            message: format!("Retrying from {}", step),
            retry_started: true,
            from_step: Some(step),
        })
    }

    pub async fn status(&self, entity_type: &str, id: Uuid) -> OrchestratorResult<RetryStatusView> {
        let (parsed, target) = self.target(entity_type)?;
        let snapshot = target.snapshot(id).await?;

        let retry_options = match (snapshot.can_retry, snapshot.failed_step) {
            (true, Some(step)) => Some(RetryOptions {
                from_current: step.into(),
                from_beginning: snapshot.first_step.into(),
            }),
            _ => None,
        };

        Ok(RetryStatusView {
            id,
            entity_type: parsed,
            status: snapshot.status,
            user_message: snapshot.user_message,
            can_retry: snapshot.can_retry,
            retry_options,
        })
    }
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ProofOutput, TxStatus};
    use crate::models::{Allocation, Checkbook, RouteConstraints, WithdrawRequest, WorkerType};
    use crate::orchestrator::testing::{harness, Harness, Mocks};
    use crate::status::{
        CheckbookStatus, ExecuteStatus, IntentType, PayoutStatus, ProofStatus, RequestStatus,
    };
    use crate::store::Store;
    use ethers::types::U256;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(h: &Harness) -> RetryCoordinator {
        RetryCoordinator::for_orchestrator(h.orchestrator.clone())
    }

    async fn checkbook_in(h: &Harness, status: CheckbookStatus) -> Checkbook {
        let mut checkbook = Checkbook::new("0xowner", 56, U256::from(100u64));
        checkbook.status = status;
        checkbook.signature = Some("0xsig".to_string());
        h.store.insert_checkbook(&checkbook).await.unwrap();
        checkbook
    }

    /// A request with a completed proof, shaped by `edit`
    async fn request_with(h: &Harness, edit: impl FnOnce(&mut WithdrawRequest)) -> WithdrawRequest {
        let mut request = WithdrawRequest::new(
            "0xowner".into(),
            "0xbeneficiary".into(),
            IntentType::RawToken,
            "0xtoken".into(),
            U256::from(1_000u64),
            vec![],
            56,
            56,
            WorkerType::DirectTransfer,
            serde_json::json!({}),
            RouteConstraints::default(),
            None,
        );
        request.proof_status = ProofStatus::Completed;
        request.proof = Some("0xproof".into());
        request.public_values = Some("0xpv".into());
        edit(&mut request);
        request.refresh_status();
        h.store.insert_withdraw_request(&request).await.unwrap();
        request
    }

    #[tokio::test]
    async fn only_failure_statuses_offer_retry() {
        let h = harness(Mocks::new());
        let coordinator = coordinator(&h);

        for status in CheckbookStatus::ALL {
            let checkbook = checkbook_in(&h, *status).await;
            let view = coordinator.status("checkbook", checkbook.id).await.unwrap();
            assert_eq!(view.can_retry, status.is_failure(), "{}", status);
            assert_eq!(view.retry_options.is_some(), status.is_failure());
            assert_eq!(view.status, status.as_str());
        }

        let failed = checkbook_in(&h, CheckbookStatus::SubmissionFailed).await;
        let options = coordinator
            .status("checkbook", failed.id)
            .await
            .unwrap()
            .retry_options
            .unwrap();
        assert_eq!(options.from_current.step, RetryStep::SubmittingCommitment);
        assert_eq!(options.from_beginning.step, RetryStep::GeneratingProof);
        assert_eq!(options.from_beginning.label, "Regenerate proof");
    }

    #[tokio::test]
    async fn healthy_entity_is_left_alone() {
        let h = harness(Mocks::new());
        let checkbook = checkbook_in(&h, CheckbookStatus::WithCheckbook).await;

        let outcome = coordinator(&h)
            .retry("checkbook", checkbook.id, None, false)
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.retry_started);
        assert_eq!(outcome.from_step, None);
        let unchanged = h.orchestrator.get_checkbook(checkbook.id).await.unwrap();
        assert_eq!(unchanged.version, checkbook.version);
    }

    #[tokio::test]
    async fn forced_restart_discards_the_old_proof() {
        let mut mocks = Mocks::new();
        mocks.proofs.expect_generate_proof().times(1).returning(|_| {
            Err(OrchestratorError::external("proof generator", "prover busy"))
        });
        let h = harness(mocks);
        let mut checkbook = checkbook_in(&h, CheckbookStatus::SubmissionFailed).await;
        checkbook.proof = Some("0xstale".to_string());
        checkbook.commitment = Some("0xcommitment".to_string());
        h.store.update_checkbook(&mut checkbook).await.unwrap();

        let err = coordinator(&h)
            .retry("checkbook", checkbook.id, None, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "external_failure");
        assert!(err.to_string().contains("generating_proof"));

        let restarted = h.orchestrator.get_checkbook(checkbook.id).await.unwrap();
        assert_eq!(restarted.status, CheckbookStatus::ProofFailed);
        assert!(restarted.proof.is_none());
        assert!(restarted.commitment.is_none());
        assert_eq!(restarted.signature.as_deref(), Some("0xsig"));
    }

    #[tokio::test]
    async fn failed_execute_resumes_at_execute() {
        let mut mocks = Mocks::new();
        mocks
            .chain
            .expect_submit()
            .times(1)
            .withf(|_, call| call.name() == "execute_withdraw")
            .returning(|_, _| Ok("0xexec2".to_string()));
        let h = harness(mocks);
        // Payout progress left over from before the execute failed
        let request = request_with(&h, |r| {
            r.execute_status = ExecuteStatus::Failed;
            r.payout_status = PayoutStatus::Processing;
        })
        .await;
        assert_eq!(request.status, RequestStatus::SubmitFailed);

        let outcome = coordinator(&h)
            .retry("withdraw_request", request.id, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.from_step, Some(RetryStep::Execute));

        let resumed = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(resumed.execute_status, ExecuteStatus::Submitted);
        assert_eq!(resumed.execute_tx_hash.as_deref(), Some("0xexec2"));
        assert_eq!(resumed.payout_status, PayoutStatus::Pending);
        assert_eq!(resumed.proof.as_deref(), Some("0xproof"));
        assert_eq!(resumed.execute_retry.count, 1);
    }

    #[tokio::test]
    async fn forced_withdraw_restart_regenerates_the_proof() {
        let mut mocks = Mocks::new();
        mocks.proofs.expect_generate_proof().times(1).returning(|_| {
            Ok(ProofOutput {
                proof: "0xfresh".to_string(),
                public_values: "0xpv2".to_string(),
                commitment: None,
            })
        });
        mocks
            .chain
            .expect_submit()
            .times(1)
            .withf(|_, call| call.name() == "execute_withdraw")
            .returning(|_, _| Ok("0xexec2".to_string()));
        let h = harness(mocks);
        let request = request_with(&h, |r| {
            r.execute_status = ExecuteStatus::Failed;
            r.execute_error = Some("reverted".into());
            r.payout_status = PayoutStatus::Processing;
            r.payout_tx_hash = Some("0xstale".into());
        })
        .await;

        let outcome = coordinator(&h)
            .retry("withdraw_request", request.id, None, true)
            .await
            .unwrap();
        assert!(outcome.retry_started);
        assert_eq!(outcome.from_step, Some(RetryStep::Proof));

        let restarted = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(restarted.proof.as_deref(), Some("0xfresh"));
        assert_eq!(restarted.public_values.as_deref(), Some("0xpv2"));
        assert_eq!(restarted.execute_status, ExecuteStatus::Submitted);
        assert_eq!(restarted.execute_tx_hash.as_deref(), Some("0xexec2"));
        assert_eq!(restarted.payout_status, PayoutStatus::Pending);
        assert!(restarted.payout_tx_hash.is_none());
    }

    #[tokio::test]
    async fn forced_withdraw_restart_failing_proof_leaves_it_cleared() {
        let mut mocks = Mocks::new();
        mocks.proofs.expect_generate_proof().times(1).returning(|_| {
            Err(OrchestratorError::external("proof generator", "prover busy"))
        });
        let h = harness(mocks);
        let request = request_with(&h, |r| r.execute_status = ExecuteStatus::Failed).await;

        let err = coordinator(&h)
            .retry("withdraw_request", request.id, None, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "external_failure");

        let restarted = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(restarted.proof_status, ProofStatus::Failed);
        assert!(restarted.proof.is_none());
        assert!(restarted.public_values.is_none());
        assert_eq!(restarted.execute_status, ExecuteStatus::Pending);
    }

    #[tokio::test]
    async fn forced_withdraw_restart_after_execute_is_refused() {
        let h = harness(Mocks::new());
        let request = request_with(&h, |r| {
            r.execute_status = ExecuteStatus::Success;
            r.payout_status = PayoutStatus::Failed;
        })
        .await;

        let err = coordinator(&h)
            .retry("withdraw_request", request.id, None, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");

        let unchanged = h.orchestrator.get_withdraw_request(request.id).await.unwrap();
        assert_eq!(unchanged.version, request.version);
        assert_eq!(unchanged.proof.as_deref(), Some("0xproof"));
        assert_eq!(unchanged.status, RequestStatus::PayoutFailed);
    }

    #[tokio::test]
    async fn payout_retries_are_bounded() {
        let h = harness(Mocks::new());
        let request = request_with(&h, |r| {
            r.execute_status = ExecuteStatus::Success;
            r.payout_status = PayoutStatus::Failed;
            r.payout_retry.count = 3;
        })
        .await;

        let err = coordinator(&h)
            .retry("withdraw_request", request.id, None, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "retry_exhausted");
        assert!(err.to_string().contains("payout"));
    }

    #[tokio::test]
    async fn check_retry_is_not_available() {
        let h = harness(Mocks::new());
        let checkbook = checkbook_in(&h, CheckbookStatus::WithCheckbook).await;
        let allocation = Allocation::new(checkbook.id, 0, U256::from(100u64));
        h.store.insert_allocations(&[allocation.clone()]).await.unwrap();
        let coordinator = coordinator(&h);

        let view = coordinator.status("check", allocation.id).await.unwrap();
        assert!(!view.can_retry);
        assert_eq!(view.status, "idle");

        let err = coordinator
            .retry("check", allocation.id, None, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_implemented");
    }

    #[tokio::test]
    async fn unknown_type_and_missing_entity() {
        let h = harness(Mocks::new());
        let coordinator = coordinator(&h);

        let err = coordinator.retry("deposit", Uuid::new_v4(), None, false).await.unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        let err = coordinator
            .retry("multisig_proposal", Uuid::new_v4(), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        let err = coordinator
            .retry("withdraw_request", Uuid::new_v4(), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    fn failing_snapshot() -> EntitySnapshot {
        EntitySnapshot {
            status: "proof_failed".to_string(),
            failed_step: Some(RetryStep::Proof),
            first_step: RetryStep::Proof,
            can_retry: true,
            user_message: "failed".to_string(),
        }
    }

    #[tokio::test]
    async fn concurrent_modification_is_retried_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut target = MockRetryTarget::new();
        target.expect_snapshot().returning(|_| Ok(failing_snapshot()));
        let counter = calls.clone();
        target.expect_dispatch().returning(move |id, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(OrchestratorError::concurrent("withdraw request", id))
            } else {
                Ok(())
            }
        });
        let coordinator = RetryCoordinator::new().register(EntityType::WithdrawRequest, Arc::new(target));

        let outcome = coordinator
            .retry("withdraw_request", Uuid::new_v4(), None, false)
            .await
            .unwrap();
        assert!(outcome.retry_started);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_conflict_surfaces() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut target = MockRetryTarget::new();
        target.expect_snapshot().returning(|_| Ok(failing_snapshot()));
        let counter = calls.clone();
        target.expect_dispatch().returning(move |id, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OrchestratorError::concurrent("withdraw request", id))
        });
        let coordinator = RetryCoordinator::new().register(EntityType::WithdrawRequest, Arc::new(target));

        let err = coordinator
            .retry("withdraw_request", Uuid::new_v4(), Some(RetryStep::Execute), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "concurrent_modification");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_proof_is_retried_with_the_stored_signature() {
        let mut mocks = Mocks::new();
        mocks
            .proofs
            .expect_generate_proof()
            .times(1)
            .withf(|req| req.signature.as_deref() == Some("0xsig"))
            .returning(|_| {
                Ok(ProofOutput {
                    proof: "0xproof".to_string(),
                    public_values: "0xpv".to_string(),
                    commitment: Some("0xcommitment".to_string()),
                })
            });
        mocks
            .chain
            .expect_submit()
            .returning(|_, _| Ok("0xcommit".to_string()));
        mocks
            .chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::pending()));
        let h = harness(mocks);
        let mut checkbook = checkbook_in(&h, CheckbookStatus::ProofFailed).await;
        checkbook.retry_count = 2;
        h.store.update_checkbook(&mut checkbook).await.unwrap();

        let outcome = coordinator(&h)
            .retry("checkbook", checkbook.id, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.from_step, Some(RetryStep::GeneratingProof));
        let retried = h.orchestrator.get_checkbook(checkbook.id).await.unwrap();
        assert_eq!(retried.status, CheckbookStatus::CommitmentPending);
        assert_eq!(retried.retry_count, 2);
    }
}
