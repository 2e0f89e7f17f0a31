use super::{PollOutcome, PollSignal, TaskHandler};
use crate::collaborators::{ChainClient, TxState, TxStatus};
use crate::config::PollingConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::PollingTask;
use crate::status::TaskStatus;
use crate::store::Store;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// What happened to one claimed task during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Rescheduled,
    QueryError,
    Cancelled,
    /// Another observer changed the task first
    Lost,
}

impl TaskOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Rescheduled => "rescheduled",
            TaskOutcome::QueryError => "query_error",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Lost => "lost",
        }
    }
}

/// Counts from one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub rescheduled: usize,
    pub query_errors: usize,
    pub cancelled: usize,
    pub errors: usize,
}

/// Claims due tasks and evaluates them against the chain
#[derive(Clone)]
pub struct PollingScheduler {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    handler: Arc<dyn TaskHandler>,
    signals: Option<mpsc::Sender<PollSignal>>,
    config: PollingConfig,
    shutdown: Arc<RwLock<bool>>,
}

impl PollingScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        handler: Arc<dyn TaskHandler>,
        config: PollingConfig,
    ) -> Self {
        Self {
            store,
            chain,
            handler,
            signals: None,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Report finished tasks on `signals`
    pub fn with_signals(mut self, signals: mpsc::Sender<PollSignal>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Scheduler loop
    pub async fn run(&self) -> OrchestratorResult<()> {
        let mut tick_interval = interval(Duration::from_millis(self.config.tick_interval_ms));

        info!(
            "Polling scheduler started (tick {}ms, batch {})",
            self.config.tick_interval_ms, self.config.batch_size
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tick_interval.tick().await;
            if let Err(e) = self.tick().await {
                error!("Polling tick failed: {}", e);
            }
        }

        info!("Polling scheduler stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Claim every due task and evaluate them concurrently.
    ///
    /// Claiming moves tasks to in_progress and leases them, so overlapping
    /// ticks (here or on another instance) never evaluate the same task twice.
    pub async fn tick(&self) -> OrchestratorResult<TickSummary> {
        let started = Instant::now();
        let lease = ChronoDuration::seconds(self.config.claim_lease_secs as i64);
        let tasks = self
            .store
            .claim_due_tasks(Utc::now(), self.config.batch_size, lease)
            .await?;

        let mut summary = TickSummary {
            claimed: tasks.len(),
            ..Default::default()
        };
        if tasks.is_empty() {
            return Ok(summary);
        }
        debug!("Claimed {} due polling tasks", tasks.len());

        let handles = tasks.into_iter().map(|task| {
            let worker = self.clone();
            tokio::spawn(async move { worker.process(task).await })
        });

        for result in join_all(handles).await {
            match result {
                Ok(Ok(outcome)) => match outcome {
                    TaskOutcome::Completed => summary.completed += 1,
                    TaskOutcome::Failed => summary.failed += 1,
                    TaskOutcome::Rescheduled => summary.rescheduled += 1,
                    TaskOutcome::QueryError => summary.query_errors += 1,
                    TaskOutcome::Cancelled => summary.cancelled += 1,
                    TaskOutcome::Lost => {}
                },
                Ok(Err(e)) => {
                    error!("Polling task evaluation failed: {}", e);
                    summary.errors += 1;
                }
                Err(e) => {
                    error!("Polling worker panicked: {}", e);
                    summary.errors += 1;
                }
            }
        }

        crate::metrics::record_tick(started.elapsed().as_secs_f64(), summary.claimed);
        Ok(summary)
    }

    async fn process(&self, mut task: PollingTask) -> OrchestratorResult<TaskOutcome> {
        let outcome = self.evaluate(&mut task).await?;
        crate::metrics::record_poll_outcome(task.task_type.as_str(), outcome.as_str());
        Ok(outcome)
    }

    async fn evaluate(&self, task: &mut PollingTask) -> OrchestratorResult<TaskOutcome> {
        match self.handler.still_relevant(task).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    task_id = %task.id,
                    entity_id = %task.entity_id,
                    "Entity left {}; cancelling polling task",
                    task.current_status
                );
                task.finish(TaskStatus::Cancelled);
                task.last_error = Some(format!("entity no longer {}", task.current_status));
                return self.save(task, TaskOutcome::Cancelled).await;
            }
            Err(e) => return self.record_query_error(task, e.to_string()).await,
        }

        let status = match self.chain.get_tx_status(task.chain_id, &task.tx_hash).await {
            Ok(status) => status,
            Err(e) => return self.record_query_error(task, e.to_string()).await,
        };

        match status.state {
            TxState::Confirmed => self.complete(task, status).await,
            TxState::Failed => {
                let reason = status
                    .error_reason
                    .clone()
                    .unwrap_or_else(|| "transaction failed on chain".to_string());
                self.fail(task, reason).await
            }
            TxState::Pending => {
                task.retry_count += 1;
                if task.retries_exhausted() {
                    let reason = format!(
                        "no confirmation for {} after {} polls",
                        task.tx_hash, task.retry_count
                    );
                    warn!(task_id = %task.id, task_type = %task.task_type, "{}", reason);
                    return self.fail(task, reason).await;
                }
                self.reschedule(task, None).await?;
                Ok(TaskOutcome::Rescheduled)
            }
        }
    }

    /// Infrastructure failures reschedule without touching the logical retry budget
    async fn record_query_error(
        &self,
        task: &mut PollingTask,
        message: String,
    ) -> OrchestratorResult<TaskOutcome> {
        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            "Polling query failed: {}",
            message
        );
        crate::metrics::record_query_error(task.task_type.as_str());
        task.query_error_count += 1;
        self.reschedule(task, Some(message)).await?;
        Ok(TaskOutcome::QueryError)
    }

    async fn reschedule(&self, task: &mut PollingTask, error: Option<String>) -> OrchestratorResult<()> {
        task.status = TaskStatus::Pending;
        task.next_poll_at = Utc::now() + task.poll_interval();
        if error.is_some() {
            task.last_error = error;
        }
        self.store.update_task(task).await
    }

    /// Persist a terminal task status. Losing the version race means another
    /// observer already acted on this task.
    async fn save(&self, task: &mut PollingTask, outcome: TaskOutcome) -> OrchestratorResult<TaskOutcome> {
        match self.store.update_task(task).await {
            Ok(()) => Ok(outcome),
            Err(e) if e.is_concurrent_modification() => {
                debug!(task_id = %task.id, "Polling task changed concurrently; skipping");
                Ok(TaskOutcome::Lost)
            }
            Err(e) => Err(e),
        }
    }

    /// The entity is advanced before the task is closed, so a handler that
    /// fails or never returns leaves the task to be polled again.
    async fn complete(&self, task: &mut PollingTask, status: TxStatus) -> OrchestratorResult<TaskOutcome> {
        if let Err(e) = self.handler.on_confirmed(task, &status).await {
            return self.reopen(task, "Advancing entity", e).await;
        }

        task.finish(TaskStatus::Completed);
        task.last_error = None;
        if self.save(task, TaskOutcome::Completed).await? == TaskOutcome::Lost {
            return Ok(TaskOutcome::Lost);
        }

        info!(
            task_id = %task.id,
            entity_id = %task.entity_id,
            task_type = %task.task_type,
            "{} confirmed in block {:?}",
            task.tx_hash,
            status.block_number
        );
        self.signal(PollSignal::new(
            task,
            PollOutcome::Confirmed {
                block_number: status.block_number,
            },
        ))
        .await;
        Ok(TaskOutcome::Completed)
    }

    async fn fail(&self, task: &mut PollingTask, reason: String) -> OrchestratorResult<TaskOutcome> {
        if let Err(e) = self.handler.on_failed(task, &reason).await {
            return self.reopen(task, "Recording failure", e).await;
        }

        task.finish(TaskStatus::Failed);
        task.last_error = Some(reason.clone());
        if self.save(task, TaskOutcome::Failed).await? == TaskOutcome::Lost {
            return Ok(TaskOutcome::Lost);
        }

        self.signal(PollSignal::new(task, PollOutcome::Failed { reason })).await;
        Ok(TaskOutcome::Failed)
    }

    /// Keep the task open after the handler failed. The next poll applies the
    /// result again or cancels the task once the entity has moved on.
    async fn reopen(
        &self,
        task: &mut PollingTask,
        action: &str,
        e: OrchestratorError,
    ) -> OrchestratorResult<TaskOutcome> {
        if e.is_retryable() {
            warn!(task_id = %task.id, "{} failed, task rescheduled: {}", action, e);
        } else {
            error!(
                task_id = %task.id,
                entity_id = %task.entity_id,
                "{} failed, task rescheduled: {}",
                action,
                e
            );
        }
        self.reschedule(task, Some(e.to_string())).await?;
        Ok(TaskOutcome::Rescheduled)
    }

    async fn signal(&self, signal: PollSignal) {
        if let Some(tx) = &self.signals {
            if tx.send(signal).await.is_err() {
                warn!("Poll signal receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockChainClient;
    use crate::models::PollingRequest;
    use crate::polling::{MockTaskHandler, PollingQueue};
    use crate::status::TaskType;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn config() -> PollingConfig {
        PollingConfig {
            initial_delay_secs: 0,
            ..PollingConfig::default()
        }
    }

    async fn enqueue(store: &Arc<MemoryStore>, max_retries: u32) -> Uuid {
        let queue = PollingQueue::new(store.clone(), config());
        let mut request = PollingRequest::new(
            TaskType::CommitmentConfirmation,
            Uuid::new_v4(),
            56,
            "0xfeed",
            "commitment_pending",
            "with_checkbook",
        );
        request.max_retries = Some(max_retries);
        request.initial_delay = Some(std::time::Duration::ZERO);
        queue.enqueue(request).await.unwrap()
    }

    /// Make a rescheduled task due again
    async fn make_due(store: &Arc<MemoryStore>, id: Uuid) {
        let mut task = store.get_task(id).await.unwrap().unwrap();
        task.next_poll_at = Utc::now() - ChronoDuration::seconds(1);
        store.update_task(&mut task).await.unwrap();
    }

    fn relevant_handler() -> MockTaskHandler {
        let mut handler = MockTaskHandler::new();
        handler.expect_still_relevant().returning(|_| Ok(true));
        handler
    }

    fn scheduler(
        store: Arc<MemoryStore>,
        chain: MockChainClient,
        handler: MockTaskHandler,
    ) -> PollingScheduler {
        PollingScheduler::new(store, Arc::new(chain), Arc::new(handler), config())
    }

    #[tokio::test]
    async fn confirmation_completes_task_and_signals() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 5).await;

        let mut chain = MockChainClient::new();
        chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::confirmed(100)));
        let mut handler = relevant_handler();
        handler.expect_on_confirmed().times(1).returning(|_, _| Ok(()));

        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = scheduler(store.clone(), chain, handler).with_signals(tx);

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.completed, 1);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.task_id, id);
        assert_eq!(
            signal.outcome,
            PollOutcome::Confirmed {
                block_number: Some(100)
            }
        );

        // Nothing due anymore; a second tick must not advance the entity again
        assert_eq!(scheduler.tick().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn mismatch_reschedules_until_budget_is_spent() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 2).await;

        let mut chain = MockChainClient::new();
        chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::pending()));
        let mut handler = relevant_handler();
        handler
            .expect_on_failed()
            .times(1)
            .withf(|_, reason| reason.contains("after 2 polls"))
            .returning(|_, _| Ok(()));
        let scheduler = scheduler(store.clone(), chain, handler);

        assert_eq!(scheduler.tick().await.unwrap().rescheduled, 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.next_poll_at > Utc::now());

        make_due(&store, id).await;
        assert_eq!(scheduler.tick().await.unwrap().failed, 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, task.max_retries);
    }

    #[tokio::test]
    async fn query_errors_do_not_consume_retry_budget() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 1).await;

        let mut chain = MockChainClient::new();
        chain.expect_get_tx_status().returning(|chain_id, _| {
            Err(OrchestratorError::Chain {
                chain_id,
                message: "connection refused".into(),
            })
        });
        let scheduler = scheduler(store.clone(), chain, relevant_handler());

        for _ in 0..3 {
            assert_eq!(scheduler.tick().await.unwrap().query_errors, 1);
            make_due(&store, id).await;
        }

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.query_error_count, 3);
        assert!(task.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn reverted_transaction_fails_task() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 10).await;

        let mut chain = MockChainClient::new();
        chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::failed("execution reverted")));
        let mut handler = relevant_handler();
        handler
            .expect_on_failed()
            .times(1)
            .withf(|_, reason| reason == "execution reverted")
            .returning(|_, _| Ok(()));
        let scheduler = scheduler(store.clone(), chain, handler);

        assert_eq!(scheduler.tick().await.unwrap().failed, 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn cancelled_entity_stops_the_task_without_querying() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 10).await;

        let mut chain = MockChainClient::new();
        chain.expect_get_tx_status().never();
        let mut handler = MockTaskHandler::new();
        handler.expect_still_relevant().returning(|_| Ok(false));
        handler.expect_on_confirmed().never();
        let scheduler = scheduler(store.clone(), chain, handler);

        assert_eq!(scheduler.tick().await.unwrap().cancelled, 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn transient_advance_failure_reopens_task() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 10).await;

        let mut chain = MockChainClient::new();
        chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::confirmed(7)));
        let mut handler = relevant_handler();
        handler
            .expect_on_confirmed()
            .returning(|_, _| Err(OrchestratorError::concurrent("checkbook", "x")));
        let scheduler = scheduler(store.clone(), chain, handler);

        assert_eq!(scheduler.tick().await.unwrap().rescheduled, 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn one_failing_query_does_not_affect_other_tasks() {
        let store = Arc::new(MemoryStore::new());
        let broken = enqueue(&store, 10).await;
        let healthy = enqueue(&store, 10).await;
        let broken_entity = store.get_task(broken).await.unwrap().unwrap().entity_id;

        let mut chain = MockChainClient::new();
        chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::confirmed(1)));
        let mut handler = MockTaskHandler::new();
        handler.expect_still_relevant().returning(move |task| {
            if task.entity_id == broken_entity {
                return Err(OrchestratorError::Internal("lookup failed".into()));
            }
            Ok(true)
        });
        handler.expect_on_confirmed().times(1).returning(|_, _| Ok(()));

        let scheduler = scheduler(store.clone(), chain, handler);
        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.query_errors, 1);
        assert_eq!(
            store.get_task(healthy).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            store.get_task(broken).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn handler_runs_while_the_task_is_still_open() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 5).await;

        let mut chain = MockChainClient::new();
        chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::confirmed(3)));
        let mut handler = relevant_handler();
        handler
            .expect_on_confirmed()
            .times(1)
            .withf(|task, _| task.status == TaskStatus::InProgress && task.completed_at.is_none())
            .returning(|_, _| Ok(()));
        let scheduler = scheduler(store.clone(), chain, handler);

        assert_eq!(scheduler.tick().await.unwrap().completed, 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn rejected_failure_keeps_the_task_open() {
        let store = Arc::new(MemoryStore::new());
        let id = enqueue(&store, 10).await;

        let mut chain = MockChainClient::new();
        chain
            .expect_get_tx_status()
            .returning(|_, _| Ok(TxStatus::failed("execution reverted")));
        let mut handler = relevant_handler();
        handler
            .expect_on_failed()
            .times(1)
            .returning(|_, _| Err(OrchestratorError::InvalidState("bad transition".into())));

        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = scheduler(store.clone(), chain, handler).with_signals(tx);

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.rescheduled, 1);
        assert_eq!(summary.errors, 0);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.completed_at.is_none());
        assert!(task.last_error.unwrap().contains("bad transition"));
        assert!(rx.try_recv().is_err());
    }
}
