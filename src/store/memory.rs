//! In-process store with the same guarantees as the PostgreSQL one
//!
//! A single lock over all tables keeps multi-row operations atomic.

use super::{ProposalStats, Store, TaskStats};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{
    Allocation, Checkbook, MultisigExecution, MultisigProposal, MultisigRejection,
    MultisigSignature, PollingTask, WithdrawRequest,
};
use crate::status::{
    AllocationStatus, CheckbookStatus, EntityType, ExecuteStatus, PayoutStatus, ProofStatus,
    ProposalStatus, RequestStatus, TaskStatus, TaskType,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    checkbooks: HashMap<Uuid, Checkbook>,
    allocations: HashMap<Uuid, Allocation>,
    requests: HashMap<Uuid, WithdrawRequest>,
    tasks: HashMap<Uuid, PollingTask>,
    proposals: HashMap<Uuid, MultisigProposal>,
    signatures: Vec<MultisigSignature>,
    rejections: Vec<MultisigRejection>,
    executions: Vec<MultisigExecution>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn has_active_task(tables: &Tables, entity_type: EntityType, entity_id: Uuid, task_type: TaskType) -> bool {
    tables.tasks.values().any(|t| {
        t.entity_type == entity_type
            && t.entity_id == entity_id
            && t.task_type == task_type
            && t.status.is_active()
    })
}

fn check_allocations(tables: &Tables, allocations: &[Allocation]) -> OrchestratorResult<()> {
    for allocation in allocations {
        let clash = tables.allocations.values().any(|a| {
            a.id == allocation.id
                || (a.checkbook_id == allocation.checkbook_id && a.seq == allocation.seq)
        });
        if clash {
            return Err(OrchestratorError::AlreadyExists(format!(
                "allocation seq {} of checkbook {}",
                allocation.seq, allocation.checkbook_id
            )));
        }
    }
    Ok(())
}

/// Version-checked replace shared by every `update_*`
fn replace_versioned<T: Clone>(
    table: &mut HashMap<Uuid, T>,
    id: Uuid,
    entity: &'static str,
    expected: i64,
    version_of: impl Fn(&T) -> i64,
    updated: &mut T,
    bump: impl Fn(&mut T),
) -> OrchestratorResult<()> {
    let current = table
        .get(&id)
        .ok_or_else(|| OrchestratorError::not_found(entity, id))?;
    if version_of(current) != expected {
        return Err(OrchestratorError::concurrent(entity, id));
    }
    bump(updated);
    table.insert(id, updated.clone());
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn insert_checkbook(&self, checkbook: &Checkbook) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        if tables.checkbooks.contains_key(&checkbook.id) {
            return Err(OrchestratorError::AlreadyExists(format!("checkbook {}", checkbook.id)));
        }
        tables.checkbooks.insert(checkbook.id, checkbook.clone());
        Ok(())
    }

    async fn get_checkbook(&self, id: Uuid) -> OrchestratorResult<Option<Checkbook>> {
        Ok(self.tables.read().await.checkbooks.get(&id).cloned())
    }

    async fn update_checkbook(&self, checkbook: &mut Checkbook) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        let expected = checkbook.version;
        replace_versioned(
            &mut tables.checkbooks,
            checkbook.id,
            "checkbook",
            expected,
            |c| c.version,
            checkbook,
            |c| {
                c.version += 1;
                c.updated_at = Utc::now();
            },
        )
    }

    async fn sign_checkbook(
        &self,
        checkbook: &mut Checkbook,
        allocations: &[Allocation],
    ) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        check_allocations(&tables, allocations)?;
        let expected = checkbook.version;
        replace_versioned(
            &mut tables.checkbooks,
            checkbook.id,
            "checkbook",
            expected,
            |c| c.version,
            checkbook,
            |c| {
                c.version += 1;
                c.updated_at = Utc::now();
            },
        )?;
        for allocation in allocations {
            tables.allocations.insert(allocation.id, allocation.clone());
        }
        Ok(())
    }

    async fn list_untracked_commitments(&self, limit: usize) -> OrchestratorResult<Vec<Checkbook>> {
        let tables = self.tables.read().await;
        let mut untracked: Vec<_> = tables
            .checkbooks
            .values()
            .filter(|c| {
                c.status == CheckbookStatus::CommitmentPending
                    && !has_active_task(
                        &tables,
                        EntityType::Checkbook,
                        c.id,
                        TaskType::CommitmentConfirmation,
                    )
            })
            .cloned()
            .collect();
        untracked.sort_by_key(|c| c.updated_at);
        untracked.truncate(limit);
        Ok(untracked)
    }

    async fn insert_allocations(&self, allocations: &[Allocation]) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        check_allocations(&tables, allocations)?;
        for allocation in allocations {
            tables.allocations.insert(allocation.id, allocation.clone());
        }
        Ok(())
    }

    async fn get_allocations(&self, ids: &[Uuid]) -> OrchestratorResult<Vec<Allocation>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.allocations.get(id).cloned())
            .collect())
    }

    async fn list_allocations(&self, checkbook_id: Uuid) -> OrchestratorResult<Vec<Allocation>> {
        let tables = self.tables.read().await;
        let mut allocations: Vec<_> = tables
            .allocations
            .values()
            .filter(|a| a.checkbook_id == checkbook_id)
            .cloned()
            .collect();
        allocations.sort_by_key(|a| a.seq);
        Ok(allocations)
    }

    async fn claim_allocations(&self, ids: &[Uuid], request_id: Uuid) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            match tables.allocations.get(id) {
                None => return Err(OrchestratorError::not_found("allocation", id)),
                Some(a) if a.status != AllocationStatus::Idle || a.withdraw_request_id.is_some() => {
                    return Err(OrchestratorError::concurrent("allocation", id));
                }
                Some(_) => {}
            }
        }

        let now = Utc::now();
        for id in ids {
            if let Some(a) = tables.allocations.get_mut(id) {
                a.status = AllocationStatus::Pending;
                a.withdraw_request_id = Some(request_id);
                a.version += 1;
                a.updated_at = now;
            }
        }
        Ok(())
    }

    async fn release_allocations(&self, request_id: Uuid) -> OrchestratorResult<u64> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut released = 0;
        for a in tables.allocations.values_mut() {
            if a.withdraw_request_id == Some(request_id) && a.status == AllocationStatus::Pending {
                a.status = AllocationStatus::Idle;
                a.withdraw_request_id = None;
                a.version += 1;
                a.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn consume_allocations(&self, request_id: Uuid) -> OrchestratorResult<u64> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut consumed = 0;
        for a in tables.allocations.values_mut() {
            if a.withdraw_request_id == Some(request_id) && a.status == AllocationStatus::Pending {
                a.status = AllocationStatus::Used;
                a.version += 1;
                a.updated_at = now;
                consumed += 1;
            }
        }
        Ok(consumed)
    }

    async fn insert_withdraw_request(&self, request: &WithdrawRequest) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        if tables.requests.contains_key(&request.id) {
            return Err(OrchestratorError::AlreadyExists(format!("withdraw request {}", request.id)));
        }
        tables.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_withdraw_request(&self, id: Uuid) -> OrchestratorResult<Option<WithdrawRequest>> {
        Ok(self.tables.read().await.requests.get(&id).cloned())
    }

    async fn update_withdraw_request(&self, request: &mut WithdrawRequest) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        let expected = request.version;
        replace_versioned(
            &mut tables.requests,
            request.id,
            "withdraw request",
            expected,
            |r| r.version,
            request,
            |r| {
                r.version += 1;
                r.updated_at = Utc::now();
            },
        )
    }

    async fn list_stale_proofs(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<Vec<WithdrawRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .requests
            .values()
            .filter(|r| r.proof_status == ProofStatus::InProgress && r.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn list_awaiting_payout(&self, limit: usize) -> OrchestratorResult<Vec<WithdrawRequest>> {
        let tables = self.tables.read().await;
        let mut ready: Vec<_> = tables
            .requests
            .values()
            .filter(|r| {
                r.execute_status == ExecuteStatus::Success
                    && r.payout_status == PayoutStatus::Pending
                    && r.status != RequestStatus::Cancelled
            })
            .cloned()
            .collect();
        ready.sort_by_key(|r| r.updated_at);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn list_untracked_executes(&self, limit: usize) -> OrchestratorResult<Vec<WithdrawRequest>> {
        let tables = self.tables.read().await;
        let mut untracked: Vec<_> = tables
            .requests
            .values()
            .filter(|r| {
                r.execute_status == ExecuteStatus::Submitted
                    && r.status != RequestStatus::Cancelled
                    && !has_active_task(
                        &tables,
                        EntityType::WithdrawRequest,
                        r.id,
                        TaskType::WithdrawExecute,
                    )
            })
            .cloned()
            .collect();
        untracked.sort_by_key(|r| r.updated_at);
        untracked.truncate(limit);
        Ok(untracked)
    }

    async fn insert_task(&self, task: &PollingTask) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        if has_active_task(&tables, task.entity_type, task.entity_id, task.task_type) {
            return Err(OrchestratorError::AlreadyActive {
                entity_type: task.entity_type.to_string(),
                entity_id: task.entity_id.to_string(),
                task_type: task.task_type.to_string(),
            });
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> OrchestratorResult<Option<PollingTask>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> OrchestratorResult<Vec<PollingTask>> {
        let mut tables = self.tables.write().await;
        let mut due: Vec<_> = tables
            .tasks
            .values()
            .filter(|t| t.status.is_active() && t.next_poll_at <= now)
            .map(|t| (t.next_poll_at, t.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(task) = tables.tasks.get_mut(&id) {
                task.status = TaskStatus::InProgress;
                task.started_at = Some(now);
                task.next_poll_at = now + lease;
                task.version += 1;
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_task(&self, task: &mut PollingTask) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        let expected = task.version;
        replace_versioned(
            &mut tables.tasks,
            task.id,
            "polling task",
            expected,
            |t| t.version,
            task,
            |t| {
                t.version += 1;
                t.updated_at = Utc::now();
            },
        )
    }

    async fn list_tasks_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> OrchestratorResult<Vec<PollingTask>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<_> = tables
            .tasks
            .values()
            .filter(|t| t.entity_type == entity_type && t.entity_id == entity_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn cancel_tasks_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        reason: &str,
    ) -> OrchestratorResult<u64> {
        let mut tables = self.tables.write().await;
        let mut cancelled = 0;
        for task in tables.tasks.values_mut() {
            if task.entity_type == entity_type && task.entity_id == entity_id && task.status.is_active() {
                task.finish(TaskStatus::Cancelled);
                task.last_error = Some(reason.to_string());
                task.version += 1;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn task_stats(&self) -> OrchestratorResult<TaskStats> {
        let tables = self.tables.read().await;
        let mut stats = TaskStats::default();
        for task in tables.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn insert_proposal(&self, proposal: &MultisigProposal) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        if tables.proposals.contains_key(&proposal.id) {
            return Err(OrchestratorError::AlreadyExists(format!("proposal {}", proposal.id)));
        }
        tables.proposals.insert(proposal.id, proposal.clone());
        Ok(())
    }

    async fn get_proposal(&self, id: Uuid) -> OrchestratorResult<Option<MultisigProposal>> {
        Ok(self.tables.read().await.proposals.get(&id).cloned())
    }

    async fn update_proposal(&self, proposal: &mut MultisigProposal) -> OrchestratorResult<()> {
        let mut tables = self.tables.write().await;
        let expected = proposal.version;
        replace_versioned(
            &mut tables.proposals,
            proposal.id,
            "proposal",
            expected,
            |p| p.version,
            proposal,
            |p| {
                p.version += 1;
                p.updated_at = Utc::now();
            },
        )
    }

    async fn add_signature(&self, signature: &MultisigSignature) -> OrchestratorResult<MultisigProposal> {
        let mut tables = self.tables.write().await;
        if !tables.proposals.contains_key(&signature.proposal_id) {
            return Err(OrchestratorError::not_found("proposal", signature.proposal_id));
        }
        let duplicate = tables
            .signatures
            .iter()
            .any(|s| s.proposal_id == signature.proposal_id && s.signer == signature.signer);
        if duplicate {
            return Err(OrchestratorError::AlreadySigned {
                proposal_id: signature.proposal_id.to_string(),
                signer: signature.signer.clone(),
            });
        }

        tables.signatures.push(signature.clone());
        let count = tables
            .signatures
            .iter()
            .filter(|s| s.proposal_id == signature.proposal_id)
            .count() as u32;

        let proposal = tables
            .proposals
            .get_mut(&signature.proposal_id)
            .ok_or_else(|| OrchestratorError::not_found("proposal", signature.proposal_id))?;
        proposal.signature_count = count;
        proposal.version += 1;
        proposal.updated_at = Utc::now();
        Ok(proposal.clone())
    }

    async fn list_signatures(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigSignature>> {
        let tables = self.tables.read().await;
        Ok(tables
            .signatures
            .iter()
            .filter(|s| s.proposal_id == proposal_id)
            .cloned()
            .collect())
    }

    async fn add_rejection(&self, rejection: &MultisigRejection) -> OrchestratorResult<MultisigProposal> {
        let mut tables = self.tables.write().await;
        if !tables.proposals.contains_key(&rejection.proposal_id) {
            return Err(OrchestratorError::not_found("proposal", rejection.proposal_id));
        }
        let duplicate = tables
            .rejections
            .iter()
            .any(|r| r.proposal_id == rejection.proposal_id && r.signer == rejection.signer);
        if duplicate {
            return Err(OrchestratorError::AlreadyExists(format!(
                "rejection by {} on proposal {}",
                rejection.signer, rejection.proposal_id
            )));
        }

        tables.rejections.push(rejection.clone());
        let count = tables
            .rejections
            .iter()
            .filter(|r| r.proposal_id == rejection.proposal_id)
            .count() as u32;

        let proposal = tables
            .proposals
            .get_mut(&rejection.proposal_id)
            .ok_or_else(|| OrchestratorError::not_found("proposal", rejection.proposal_id))?;
        proposal.rejection_count = count;
        proposal.version += 1;
        proposal.updated_at = Utc::now();
        Ok(proposal.clone())
    }

    async fn insert_execution(&self, execution: &MultisigExecution) -> OrchestratorResult<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .executions
            .iter()
            .any(|e| e.execute_tx_hash == execution.execute_tx_hash)
        {
            return Ok(false);
        }
        tables.executions.push(execution.clone());
        Ok(true)
    }

    async fn list_executions(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigExecution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .iter()
            .filter(|e| e.proposal_id == proposal_id)
            .cloned()
            .collect())
    }

    async fn expire_overdue_proposals(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<Uuid>> {
        let mut tables = self.tables.write().await;
        let mut expired = Vec::new();
        for proposal in tables.proposals.values_mut() {
            let sweepable = matches!(
                proposal.status,
                ProposalStatus::Pending | ProposalStatus::ExecutionFailed
            );
            if sweepable && proposal.deadline < now {
                proposal.status = ProposalStatus::Expired;
                proposal.expired_at = Some(now);
                proposal.version += 1;
                proposal.updated_at = now;
                expired.push(proposal.id);
            }
        }
        Ok(expired)
    }

    async fn proposal_stats(&self) -> OrchestratorResult<ProposalStats> {
        let tables = self.tables.read().await;
        let mut stats = ProposalStats::default();
        for proposal in tables.proposals.values() {
            match proposal.status {
                ProposalStatus::Pending => stats.pending += 1,
                ProposalStatus::Executing => stats.executing += 1,
                ProposalStatus::ExecutionFailed => stats.execution_failed += 1,
                ProposalStatus::Executed => stats.executed += 1,
                ProposalStatus::Rejected => stats.rejected += 1,
                ProposalStatus::Expired => stats.expired += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PollingRequest;
    use crate::status::TaskType;
    use ethers::types::U256;

    fn task(entity_id: Uuid) -> PollingTask {
        PollingTask::from_request(
            PollingRequest::new(
                TaskType::CommitmentConfirmation,
                entity_id,
                56,
                "0xabc",
                "commitment_pending",
                "with_checkbook",
            ),
            std::time::Duration::from_secs(10),
            3,
            std::time::Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn stale_version_is_a_concurrent_modification() {
        let store = MemoryStore::new();
        let cb = Checkbook::new("0xowner", 56, U256::from(10));
        store.insert_checkbook(&cb).await.unwrap();

        let mut first = cb.clone();
        let mut second = cb.clone();
        store.update_checkbook(&mut first).await.unwrap();
        assert_eq!(first.version, 1);

        let err = store.update_checkbook(&mut second).await.unwrap_err();
        assert!(err.is_concurrent_modification());
    }

    #[tokio::test]
    async fn one_active_task_per_entity_and_type() {
        let store = MemoryStore::new();
        let entity = Uuid::new_v4();
        store.insert_task(&task(entity)).await.unwrap();

        let err = store.insert_task(&task(entity)).await.unwrap_err();
        assert_eq!(err.code(), "already_active");

        let cancelled = store
            .cancel_tasks_for_entity(EntityType::Checkbook, entity, "test")
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
        store.insert_task(&task(entity)).await.unwrap();
    }

    #[tokio::test]
    async fn claimed_tasks_are_hidden_until_the_lease_ends() {
        let store = MemoryStore::new();
        store.insert_task(&task(Uuid::new_v4())).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let lease = Duration::minutes(10);
        let claimed = store.claim_due_tasks(now, 10, lease).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, TaskStatus::InProgress);

        assert!(store.claim_due_tasks(now, 10, lease).await.unwrap().is_empty());

        let after_lease = now + lease + Duration::seconds(1);
        assert_eq!(store.claim_due_tasks(after_lease, 10, lease).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn allocation_claim_is_all_or_nothing() {
        let store = MemoryStore::new();
        let checkbook = Uuid::new_v4();
        let a1 = Allocation::new(checkbook, 0, U256::from(5));
        let a2 = Allocation::new(checkbook, 1, U256::from(5));
        store.insert_allocations(&[a1.clone(), a2.clone()]).await.unwrap();

        store.claim_allocations(&[a2.id], Uuid::new_v4()).await.unwrap();
        let err = store
            .claim_allocations(&[a1.id, a2.id], Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(err.is_concurrent_modification());

        let a1_now = store.get_allocations(&[a1.id]).await.unwrap();
        assert_eq!(a1_now[0].status, AllocationStatus::Idle);
    }

    #[tokio::test]
    async fn consume_is_idempotent() {
        let store = MemoryStore::new();
        let checkbook = Uuid::new_v4();
        let request = Uuid::new_v4();
        let a1 = Allocation::new(checkbook, 0, U256::from(5));
        store.insert_allocations(&[a1.clone()]).await.unwrap();
        store.claim_allocations(&[a1.id], request).await.unwrap();

        assert_eq!(store.consume_allocations(request).await.unwrap(), 1);
        assert_eq!(store.consume_allocations(request).await.unwrap(), 0);
        assert_eq!(store.release_allocations(request).await.unwrap(), 0);
    }
}
