//! Typed error hierarchy for the conductor core.
//!
//! Two top-level enums cover the two request-bearing subsystems:
//! - `TransitionError` — phase state machine failures
//! - `DispatchError` — queue dispatcher failures
//!
//! Callers branch on variants, never on strings. Claim conflicts are not an
//! error at all: `ClaimStore::claim` returns `Ok(false)` and the caller
//! selects a different task.

use crate::phase::TaskPhase;
use thiserror::Error;

/// Errors from `PhaseMachine::advance_phase`.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// Target phase is not reachable from the current phase. Fatal to the
    /// request; the task is untouched.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskPhase, to: TaskPhase },

    /// The evidence gate for the current phase reported missing or invalid
    /// artifacts. Retryable once the artifacts exist. The concrete missing
    /// list is always carried so callers can surface it.
    #[error("evidence gate for {phase} failed, missing: {missing:?}")]
    EvidenceGateFailure {
        phase: TaskPhase,
        missing: Vec<String>,
        details: Vec<String>,
    },

    /// The (task, phase) lease is held by a non-stale holder. Retryable
    /// with backoff.
    #[error("lease unavailable for {resource_key}")]
    LeaseUnavailable { resource_key: String },

    /// Hash-chain verification failed. The sole locally unrecoverable
    /// condition: further writes against this task's lineage must halt and
    /// be escalated, never rewritten.
    #[error("ledger corruption for task {task_id} at sequence {broken_at}")]
    LedgerCorruption { task_id: String, broken_at: i64 },

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransitionError {
    /// Whether the caller may retry the same request after fixing inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransitionError::EvidenceGateFailure { .. } | TransitionError::LeaseUnavailable { .. }
        )
    }
}

/// Errors from the priority queue dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue item for task {0} not found")]
    ItemNotFound(String),

    #[error("queue item for task {task_id} is {status}, expected {expected}")]
    InvalidItemStatus {
        task_id: String,
        status: String,
        expected: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_carries_both_phases() {
        let err = TransitionError::IllegalTransition {
            from: TaskPhase::Spec,
            to: TaskPhase::Implement,
        };
        match &err {
            TransitionError::IllegalTransition { from, to } => {
                assert_eq!(*from, TaskPhase::Spec);
                assert_eq!(*to, TaskPhase::Implement);
            }
            _ => panic!("expected IllegalTransition"),
        }
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("spec"));
    }

    #[test]
    fn gate_failure_carries_missing_artifacts() {
        let err = TransitionError::EvidenceGateFailure {
            phase: TaskPhase::Implement,
            missing: vec!["build_log".into()],
            details: vec!["no build ran".into()],
        };
        match &err {
            TransitionError::EvidenceGateFailure { missing, .. } => {
                assert_eq!(missing, &vec!["build_log".to_string()]);
            }
            _ => panic!("expected EvidenceGateFailure"),
        }
        assert!(err.is_retryable());
        assert!(err.to_string().contains("build_log"));
    }

    #[test]
    fn lease_unavailable_is_retryable() {
        let err = TransitionError::LeaseUnavailable {
            resource_key: "task/T1/verify".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn ledger_corruption_is_not_retryable() {
        let err = TransitionError::LedgerCorruption {
            task_id: "T1".into(),
            broken_at: 3,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("sequence 3"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TransitionError::TaskNotFound("T1".into()));
        assert_std_error(&DispatchError::ItemNotFound("T1".into()));
    }
}
