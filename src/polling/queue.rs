use crate::config::PollingConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{PollingRequest, PollingTask};
use crate::status::{EntityType, TaskStatus};
use crate::store::{Store, TaskStats};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Creates and administers polling tasks
pub struct PollingQueue {
    store: Arc<dyn Store>,
    config: PollingConfig,
}

impl PollingQueue {
    pub fn new(store: Arc<dyn Store>, config: PollingConfig) -> Self {
        Self { store, config }
    }

    /// Create a task for an asynchronous hand-off.
    ///
    /// Fails with `AlreadyActive` while another pending or in-progress task
    /// exists for the same entity and task type.
    pub async fn enqueue(&self, request: PollingRequest) -> OrchestratorResult<Uuid> {
        if request.tx_hash.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument(format!(
                "{} task for {} has no transaction hash",
                request.task_type, request.entity_id
            )));
        }

        let task = PollingTask::from_request(
            request,
            Duration::from_secs(self.config.default_poll_interval_secs),
            self.config.default_max_retries,
            Duration::from_secs(self.config.initial_delay_secs),
        );

        self.store.insert_task(&task).await?;
        crate::metrics::record_task_enqueued(task.task_type.as_str());

        info!(
            task_id = %task.id,
            entity_id = %task.entity_id,
            task_type = %task.task_type,
            tx_hash = %task.tx_hash,
            "Polling task enqueued (max {} polls every {}s)",
            task.max_retries,
            task.poll_interval_secs
        );
        Ok(task.id)
    }

    pub async fn get_task(&self, id: Uuid) -> OrchestratorResult<PollingTask> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("polling task", id))
    }

    /// Administratively cancel an active task
    pub async fn stop_task(&self, id: Uuid) -> OrchestratorResult<PollingTask> {
        let mut task = self.get_task(id).await?;
        if !task.status.is_active() {
            return Err(OrchestratorError::InvalidState(format!(
                "polling task {} is already {}",
                id, task.status
            )));
        }

        task.finish(TaskStatus::Cancelled);
        task.last_error = Some("stopped by operator".to_string());
        self.store.update_task(&mut task).await?;

        info!(task_id = %id, "Polling task stopped");
        Ok(task)
    }

    pub async fn list_tasks_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> OrchestratorResult<Vec<PollingTask>> {
        self.store.list_tasks_by_entity(entity_type, entity_id).await
    }

    /// Cancel every active task of an entity, e.g. when the entity is cancelled
    pub async fn cancel_tasks_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        reason: &str,
    ) -> OrchestratorResult<u64> {
        let cancelled = self
            .store
            .cancel_tasks_for_entity(entity_type, entity_id, reason)
            .await?;
        if cancelled > 0 {
            debug!(entity_id = %entity_id, "Cancelled {} polling tasks: {}", cancelled, reason);
        }
        Ok(cancelled)
    }

    pub async fn stats(&self) -> OrchestratorResult<TaskStats> {
        self.store.task_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TaskType;
    use crate::store::MemoryStore;

    fn queue() -> PollingQueue {
        PollingQueue::new(Arc::new(MemoryStore::new()), PollingConfig::default())
    }

    fn request(entity_id: Uuid) -> PollingRequest {
        PollingRequest::new(
            TaskType::WithdrawExecute,
            entity_id,
            56,
            "0xabc",
            "submitted",
            "success",
        )
    }

    #[tokio::test]
    async fn duplicate_active_task_is_refused() {
        let queue = queue();
        let entity_id = Uuid::new_v4();

        queue.enqueue(request(entity_id)).await.unwrap();
        let err = queue.enqueue(request(entity_id)).await.unwrap_err();
        assert_eq!(err.code(), "already_active");

        // A different task type for the same entity is fine
        let mut payout = request(entity_id);
        payout.task_type = TaskType::WithdrawPayout;
        queue.enqueue(payout).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_task_frees_the_slot() {
        let queue = queue();
        let entity_id = Uuid::new_v4();

        let id = queue.enqueue(request(entity_id)).await.unwrap();
        let stopped = queue.stop_task(id).await.unwrap();
        assert_eq!(stopped.status, TaskStatus::Cancelled);
        assert!(queue.stop_task(id).await.is_err());

        queue.enqueue(request(entity_id)).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn defaults_fill_missing_parameters() {
        let queue = queue();
        let id = queue.enqueue(request(Uuid::new_v4())).await.unwrap();
        let task = queue.get_task(id).await.unwrap();
        assert_eq!(task.max_retries, 180);
        assert_eq!(task.poll_interval_secs, 10);
        assert_eq!(task.entity_type, EntityType::WithdrawRequest);
    }
}
