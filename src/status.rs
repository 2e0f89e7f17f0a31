//! Status vocabulary shared by every entity
//!
//! Statuses are closed enums internally and persisted as their snake_case
//! strings, which collaborators and UIs compare bit-exact.

use crate::error::OrchestratorError;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Declares a string-valued status enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }

        impl FromStr for $name {
            type Err = OrchestratorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(OrchestratorError::InvalidArgument(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Checkbook lifecycle
    CheckbookStatus {
        Pending => "pending",
        Unsigned => "unsigned",
        ReadyForCommitment => "ready_for_commitment",
        GeneratingProof => "generating_proof",
        SubmittingCommitment => "submitting_commitment",
        CommitmentPending => "commitment_pending",
        WithCheckbook => "with_checkbook",
        ProofFailed => "proof_failed",
        SubmissionFailed => "submission_failed",
    }
}

impl CheckbookStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckbookStatus::ProofFailed | CheckbookStatus::SubmissionFailed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckbookStatus::WithCheckbook)
    }

    /// Forward transitions plus the failure branches. Retry re-entry from a
    /// failure status goes back to the stage that failed.
    pub fn can_transition_to(&self, next: CheckbookStatus) -> bool {
        use CheckbookStatus::*;
        match self {
            Pending => matches!(next, Unsigned),
            Unsigned => matches!(next, ReadyForCommitment),
            ReadyForCommitment => matches!(next, GeneratingProof),
            GeneratingProof => matches!(next, SubmittingCommitment | ProofFailed),
            SubmittingCommitment => matches!(next, CommitmentPending | SubmissionFailed | ProofFailed),
            CommitmentPending => matches!(next, WithCheckbook | SubmissionFailed),
            WithCheckbook => false,
            ProofFailed => matches!(next, GeneratingProof),
            SubmissionFailed => matches!(next, SubmittingCommitment | GeneratingProof),
        }
    }
}

string_enum! {
    /// Allocation ("check") lifecycle
    AllocationStatus {
        Idle => "idle",
        Pending => "pending",
        Used => "used",
    }
}

string_enum! {
    ProofStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    ExecuteStatus {
        Pending => "pending",
        Submitted => "submitted",
        Success => "success",
        Failed => "failed",
    }
}

string_enum! {
    PayoutStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    HookStatus {
        NotRequired => "not_required",
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    /// Summary status of a withdraw request, derived from its four stages
    RequestStatus {
        Created => "created",
        Proving => "proving",
        ProofFailed => "proof_failed",
        ProofGenerated => "proof_generated",
        Submitting => "submitting",
        SubmitFailed => "submit_failed",
        WaitingForPayout => "waiting_for_payout",
        PayoutProcessing => "payout_processing",
        PayoutFailed => "payout_failed",
        HookProcessing => "hook_processing",
        HookFailed => "hook_failed",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RequestStatus::ProofFailed
                | RequestStatus::SubmitFailed
                | RequestStatus::PayoutFailed
                | RequestStatus::HookFailed
        )
    }
}

string_enum! {
    TaskStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl TaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

string_enum! {
    /// What a polling task is waiting for
    TaskType {
        CommitmentConfirmation => "commitment_confirmation",
        WithdrawExecute => "withdraw_execute",
        WithdrawPayout => "withdraw_payout",
        WithdrawHook => "withdraw_hook",
        MultisigExecution => "multisig_execution",
    }
}

impl TaskType {
    pub fn entity_type(&self) -> EntityType {
        match self {
            TaskType::CommitmentConfirmation => EntityType::Checkbook,
            TaskType::WithdrawExecute | TaskType::WithdrawPayout | TaskType::WithdrawHook => {
                EntityType::WithdrawRequest
            }
            TaskType::MultisigExecution => EntityType::MultisigProposal,
        }
    }
}

string_enum! {
    ProposalStatus {
        Pending => "pending",
        Executing => "executing",
        ExecutionFailed => "execution_failed",
        Executed => "executed",
        Rejected => "rejected",
        Expired => "expired",
    }
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Executed | ProposalStatus::Rejected | ProposalStatus::Expired
        )
    }
}

string_enum! {
    /// Entity kinds addressable by polling tasks and the retry coordinator
    EntityType {
        Checkbook => "checkbook",
        Allocation => "check",
        WithdrawRequest => "withdraw_request",
        MultisigProposal => "multisig_proposal",
    }
}

string_enum! {
    /// Whether a withdrawal pays out the raw token or an adapter-wrapped asset
    IntentType {
        RawToken => "raw_token",
        AssetToken => "asset_token",
    }
}

string_enum! {
    /// Stage a retry resumes from
    RetryStep {
        GeneratingProof => "generating_proof",
        SubmittingCommitment => "submitting_commitment",
        Proof => "proof",
        Execute => "execute",
        Payout => "payout",
        Hook => "hook",
    }
}

impl RetryStep {
    pub fn label(&self) -> &'static str {
        match self {
            RetryStep::GeneratingProof => "Regenerate proof",
            RetryStep::SubmittingCommitment => "Resubmit commitment",
            RetryStep::Proof => "Regenerate withdrawal proof",
            RetryStep::Execute => "Resubmit withdrawal transaction",
            RetryStep::Payout => "Retry payout",
            RetryStep::Hook => "Retry hook call",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_strings_round_trip() {
        for status in CheckbookStatus::ALL {
            assert_eq!(status.as_str().parse::<CheckbookStatus>().unwrap(), *status);
        }
        assert_eq!(EntityType::Allocation.as_str(), "check");
        assert_eq!(
            serde_json::from_str::<EntityType>("\"check\"").unwrap(),
            EntityType::Allocation
        );
        assert_eq!(
            serde_json::to_string(&HookStatus::NotRequired).unwrap(),
            "\"not_required\""
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "sealed".parse::<CheckbookStatus>().unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn checkbook_failures_return_to_their_stage() {
        use CheckbookStatus::*;
        assert!(ProofFailed.can_transition_to(GeneratingProof));
        assert!(!ProofFailed.can_transition_to(SubmittingCommitment));
        assert!(SubmissionFailed.can_transition_to(SubmittingCommitment));
        assert!(!ProofFailed.can_transition_to(Pending));
        assert!(!WithCheckbook.can_transition_to(GeneratingProof));
    }

    #[test]
    fn only_failure_statuses_are_failures() {
        let failures: Vec<_> = CheckbookStatus::ALL
            .iter()
            .filter(|s| s.is_failure())
            .collect();
        assert_eq!(
            failures,
            vec![&CheckbookStatus::ProofFailed, &CheckbookStatus::SubmissionFailed]
        );
    }
}
