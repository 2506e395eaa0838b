//! Succession error taxonomy.

use crate::case::CaseState;
use crate::collaborators::CollaboratorError;
use crate::heartbeat::LivenessError;
use crate::quorum::QuorumError;
use crate::settlement::StepKind;
use deadhand_audit::AuditError;
use deadhand_core::{CaseId, PrincipalId, RepositoryError};
use deadhand_shamir::ShamirError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SuccessionError {
    #[error("Not enough shares to reconstruct: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("Invalid share: {0}")]
    InvalidShare(String),

    #[error("Verification quorum not met: {verified} of {required} channels")]
    QuorumNotMet { verified: usize, required: usize },

    #[error("Audit chain integrity violated at entry {sequence}")]
    AuditIntegrityViolation { sequence: u64 },

    #[error("Stale transition on {case_id}: case is at epoch {expected}, request carried {actual}")]
    StaleTransition {
        case_id: CaseId,
        expected: u64,
        actual: u64,
    },

    #[error("Step {step} was force-resolved after {blocked_days} days blocked")]
    DeadlockExceeded { step: StepKind, blocked_days: i64 },

    #[error("Collaborator {collaborator} timed out after {timeout_secs}s")]
    CollaboratorTimeout {
        collaborator: String,
        timeout_secs: u64,
    },

    #[error("Step {step} cannot complete before {waiting_on}")]
    OutOfOrder { step: StepKind, waiting_on: StepKind },

    #[error("Invalid case transition {from:?} -> {to:?}")]
    InvalidTransition { from: CaseState, to: CaseState },

    #[error("Case {case_id} is {state:?}; cannot {operation}")]
    WrongState {
        case_id: CaseId,
        state: CaseState,
        operation: &'static str,
    },

    #[error("Unknown case: {0}")]
    UnknownCase(CaseId),

    #[error("Unknown principal: {0}")]
    UnknownPrincipal(PrincipalId),

    #[error("Principal {0} is archived")]
    PrincipalArchived(PrincipalId),

    #[error("No secret registered for {0}")]
    MissingSecretHandle(PrincipalId),

    #[error(transparent)]
    Liveness(LivenessError),

    #[error(transparent)]
    Quorum(QuorumError),

    #[error(transparent)]
    Collaborator(CollaboratorError),

    #[error(transparent)]
    Audit(AuditError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<ShamirError> for SuccessionError {
    fn from(e: ShamirError) -> Self {
        match e {
            ShamirError::InsufficientShares { have, need } => {
                SuccessionError::InsufficientShares { have, need }
            }
            ShamirError::InvalidShare(reason) => SuccessionError::InvalidShare(reason),
            other => SuccessionError::InvalidShare(other.to_string()),
        }
    }
}

impl From<LivenessError> for SuccessionError {
    fn from(e: LivenessError) -> Self {
        match e {
            LivenessError::UnknownPrincipal(id) => SuccessionError::UnknownPrincipal(id),
            LivenessError::Archived(id) => SuccessionError::PrincipalArchived(id),
            LivenessError::Repository(e) => SuccessionError::Repository(e),
            other => SuccessionError::Liveness(other),
        }
    }
}

impl From<AuditError> for SuccessionError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::IntegrityViolation { sequence } | AuditError::Halted { sequence } => {
                SuccessionError::AuditIntegrityViolation { sequence }
            }
            other => SuccessionError::Audit(other),
        }
    }
}

impl From<QuorumError> for SuccessionError {
    fn from(e: QuorumError) -> Self {
        match e {
            QuorumError::StaleEpoch {
                case_id,
                expected,
                actual,
            } => SuccessionError::StaleTransition {
                case_id,
                expected,
                actual,
            },
            QuorumError::Repository(e) => SuccessionError::Repository(e),
            other => SuccessionError::Quorum(other),
        }
    }
}

impl From<CollaboratorError> for SuccessionError {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::Timeout {
                collaborator,
                timeout_secs,
            } => SuccessionError::CollaboratorTimeout {
                collaborator: collaborator.to_string(),
                timeout_secs,
            },
            other => SuccessionError::Collaborator(other),
        }
    }
}
