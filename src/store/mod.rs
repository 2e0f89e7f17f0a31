//! Persistence for entity state
//!
//! The store is the single source of truth for statuses and retry counters.
//! Every mutable row carries a `version`; `update_*` writes succeed only when
//! the stored version still matches the caller's copy and fail with
//! `ConcurrentModification` otherwise.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::OrchestratorResult;
use crate::models::{
    Allocation, Checkbook, MultisigExecution, MultisigProposal, MultisigRejection,
    MultisigSignature, PollingTask, WithdrawRequest,
};
use crate::status::EntityType;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Polling task counts by status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Proposal counts by status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProposalStats {
    pub pending: u64,
    pub executing: u64,
    pub execution_failed: u64,
    pub executed: u64,
    pub rejected: u64,
    pub expired: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> OrchestratorResult<()>;

    // Checkbooks and allocations

    async fn insert_checkbook(&self, checkbook: &Checkbook) -> OrchestratorResult<()>;
    async fn get_checkbook(&self, id: Uuid) -> OrchestratorResult<Option<Checkbook>>;
    async fn update_checkbook(&self, checkbook: &mut Checkbook) -> OrchestratorResult<()>;
    /// Version-checked checkbook update plus allocation inserts, all or nothing
    async fn sign_checkbook(
        &self,
        checkbook: &mut Checkbook,
        allocations: &[Allocation],
    ) -> OrchestratorResult<()>;

    /// Checkbooks in commitment_pending with no active confirmation task
    async fn list_untracked_commitments(&self, limit: usize) -> OrchestratorResult<Vec<Checkbook>>;

    async fn insert_allocations(&self, allocations: &[Allocation]) -> OrchestratorResult<()>;
    async fn get_allocations(&self, ids: &[Uuid]) -> OrchestratorResult<Vec<Allocation>>;
    async fn list_allocations(&self, checkbook_id: Uuid) -> OrchestratorResult<Vec<Allocation>>;
    /// Link idle allocations to a request, all or nothing
    async fn claim_allocations(&self, ids: &[Uuid], request_id: Uuid) -> OrchestratorResult<()>;
    /// Return a request's pending allocations to idle
    async fn release_allocations(&self, request_id: Uuid) -> OrchestratorResult<u64>;
    /// Mark a request's pending allocations used; a second call finds nothing to do
    async fn consume_allocations(&self, request_id: Uuid) -> OrchestratorResult<u64>;

    // Withdraw requests

    async fn insert_withdraw_request(&self, request: &WithdrawRequest) -> OrchestratorResult<()>;
    async fn get_withdraw_request(&self, id: Uuid) -> OrchestratorResult<Option<WithdrawRequest>>;
    async fn update_withdraw_request(&self, request: &mut WithdrawRequest) -> OrchestratorResult<()>;
    /// Requests whose proof has been in progress since before `cutoff`
    async fn list_stale_proofs(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<Vec<WithdrawRequest>>;
    /// Requests with a successful execute and a payout that never started
    async fn list_awaiting_payout(&self, limit: usize) -> OrchestratorResult<Vec<WithdrawRequest>>;
    /// Requests with a submitted execute and no active execute polling task
    async fn list_untracked_executes(&self, limit: usize) -> OrchestratorResult<Vec<WithdrawRequest>>;

    // Polling tasks

    /// Fails with `AlreadyActive` when an active task exists for the same
    /// entity and task type
    async fn insert_task(&self, task: &PollingTask) -> OrchestratorResult<()>;
    async fn get_task(&self, id: Uuid) -> OrchestratorResult<Option<PollingTask>>;
    /// Atomically claim up to `limit` due tasks, moving them to in_progress and
    /// hiding them from other claimers for `lease`
    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> OrchestratorResult<Vec<PollingTask>>;
    async fn update_task(&self, task: &mut PollingTask) -> OrchestratorResult<()>;
    async fn list_tasks_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> OrchestratorResult<Vec<PollingTask>>;
    async fn cancel_tasks_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        reason: &str,
    ) -> OrchestratorResult<u64>;
    async fn task_stats(&self) -> OrchestratorResult<TaskStats>;

    // Multisig

    async fn insert_proposal(&self, proposal: &MultisigProposal) -> OrchestratorResult<()>;
    async fn get_proposal(&self, id: Uuid) -> OrchestratorResult<Option<MultisigProposal>>;
    async fn update_proposal(&self, proposal: &mut MultisigProposal) -> OrchestratorResult<()>;
    /// Insert a signature and recount, serialized per proposal. Fails with
    /// `AlreadySigned` on a repeated signer.
    async fn add_signature(&self, signature: &MultisigSignature) -> OrchestratorResult<MultisigProposal>;
    async fn list_signatures(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigSignature>>;
    /// Insert a rejection and recount. Fails with `AlreadyExists` on a repeated signer.
    async fn add_rejection(&self, rejection: &MultisigRejection) -> OrchestratorResult<MultisigProposal>;
    /// Returns false when the execution tx hash was already recorded
    async fn insert_execution(&self, execution: &MultisigExecution) -> OrchestratorResult<bool>;
    async fn list_executions(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigExecution>>;
    /// Move pending or execution_failed proposals past their deadline to expired
    async fn expire_overdue_proposals(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<Uuid>>;
    async fn proposal_stats(&self) -> OrchestratorResult<ProposalStats>;
}
