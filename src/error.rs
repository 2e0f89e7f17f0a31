//! Error types for the orchestration engine

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Active {task_type} task already exists for {entity_type} {entity_id}")]
    AlreadyActive {
        entity_type: String,
        entity_id: String,
        task_type: String,
    },

    #[error("Signer {signer} already signed proposal {proposal_id}")]
    AlreadySigned { proposal_id: String, signer: String },

    #[error("Proposal {0} already executed")]
    AlreadyExecuted(String),

    #[error("Proposal {0} already rejected")]
    AlreadyRejected(String),

    #[error("Insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: u32, need: u32 },

    #[error("Retry limit reached for {what} after {attempts} attempts")]
    RetryExhausted { what: String, attempts: u32 },

    #[error("{collaborator} failed: {message}")]
    ExternalFailure {
        collaborator: &'static str,
        message: String,
    },

    #[error("{entity} {id} was modified concurrently, retry the request")]
    ConcurrentModification { entity: &'static str, id: String },

    #[error("Temporarily disabled: {0}")]
    NotImplemented(String),

    #[error("Stage {step} failed: {source}")]
    StageFailed {
        step: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error for chain {chain_id}: {message}")]
    Chain { chain_id: u64, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn concurrent(entity: &'static str, id: impl ToString) -> Self {
        OrchestratorError::ConcurrentModification {
            entity,
            id: id.to_string(),
        }
    }

    pub fn external(collaborator: &'static str, message: impl ToString) -> Self {
        OrchestratorError::ExternalFailure {
            collaborator,
            message: message.to_string(),
        }
    }

    /// Attach the retry step that was being dispatched
    pub fn in_stage(self, step: impl ToString) -> Self {
        OrchestratorError::StageFailed {
            step: step.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through stage context
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self.root(), OrchestratorError::ConcurrentModification { .. })
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            OrchestratorError::ConcurrentModification { .. }
                | OrchestratorError::Chain { .. }
                | OrchestratorError::Database(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self.root(),
            OrchestratorError::RetryExhausted { .. } | OrchestratorError::Internal(_)
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self.root() {
            OrchestratorError::NotFound { .. } => "not_found",
            OrchestratorError::InvalidState(_) => "invalid_state",
            OrchestratorError::InvalidArgument(_) => "invalid_argument",
            OrchestratorError::AlreadyExists(_) => "already_exists",
            OrchestratorError::AlreadyActive { .. } => "already_active",
            OrchestratorError::AlreadySigned { .. } => "already_signed",
            OrchestratorError::AlreadyExecuted(_) => "already_executed",
            OrchestratorError::AlreadyRejected(_) => "already_rejected",
            OrchestratorError::InsufficientSignatures { .. } => "insufficient_signatures",
            OrchestratorError::RetryExhausted { .. } => "retry_exhausted",
            OrchestratorError::ExternalFailure { .. } => "external_failure",
            OrchestratorError::ConcurrentModification { .. } => "concurrent_modification",
            OrchestratorError::NotImplemented(_) => "not_implemented",
            OrchestratorError::StageFailed { .. } => "stage_failed",
            OrchestratorError::Database(_) => "database",
            OrchestratorError::Chain { .. } => "chain",
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_context_keeps_root_kind() {
        let err = OrchestratorError::concurrent("checkbook", "abc").in_stage("generating_proof");
        assert!(err.is_concurrent_modification());
        assert!(err.is_retryable());
        assert_eq!(err.code(), "concurrent_modification");
        assert!(err.to_string().contains("generating_proof"));
    }

    #[test]
    fn exhausted_retries_alert() {
        let err = OrchestratorError::RetryExhausted {
            what: "payout".to_string(),
            attempts: 5,
        };
        assert!(err.should_alert());
        assert!(!err.is_retryable());
    }
}
