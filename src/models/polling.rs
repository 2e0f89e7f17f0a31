use crate::status::{EntityType, TaskStatus, TaskType};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parameters for enqueueing a reconciliation job
#[derive(Debug, Clone)]
pub struct PollingRequest {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub task_type: TaskType,
    pub chain_id: u64,
    pub tx_hash: String,
    pub target_status: String,
    pub current_status: String,
    pub poll_interval: Option<std::time::Duration>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<std::time::Duration>,
}

impl PollingRequest {
    pub fn new(
        task_type: TaskType,
        entity_id: Uuid,
        chain_id: u64,
        tx_hash: impl Into<String>,
        current_status: impl ToString,
        target_status: impl ToString,
    ) -> Self {
        Self {
            entity_type: task_type.entity_type(),
            entity_id,
            task_type,
            chain_id,
            tx_hash: tx_hash.into(),
            target_status: target_status.to_string(),
            current_status: current_status.to_string(),
            poll_interval: None,
            max_retries: None,
            initial_delay: None,
        }
    }
}

/// A durable "poll until condition or give up" record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingTask {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub task_type: TaskType,
    pub chain_id: u64,
    pub tx_hash: String,
    pub target_status: String,
    /// Entity status when the task was created
    pub current_status: String,
    pub status: TaskStatus,
    /// Logical mismatches: the chain answered and the target was not reached
    pub retry_count: u32,
    pub max_retries: u32,
    /// Infrastructure failures while asking the chain
    pub query_error_count: u32,
    pub poll_interval_secs: u64,
    pub next_poll_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PollingTask {
    pub fn from_request(
        req: PollingRequest,
        default_interval: std::time::Duration,
        default_max_retries: u32,
        default_delay: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let delay = req.initial_delay.unwrap_or(default_delay);
        Self {
            id: Uuid::new_v4(),
            entity_type: req.entity_type,
            entity_id: req.entity_id,
            task_type: req.task_type,
            chain_id: req.chain_id,
            tx_hash: req.tx_hash,
            target_status: req.target_status,
            current_status: req.current_status,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: req.max_retries.unwrap_or(default_max_retries).max(1),
            query_error_count: 0,
            poll_interval_secs: req.poll_interval.unwrap_or(default_interval).as_secs().max(1),
            next_poll_at: now + Duration::milliseconds(delay.as_millis() as i64),
            started_at: None,
            completed_at: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::seconds(self.poll_interval_secs as i64)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn finish(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}
