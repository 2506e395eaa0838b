//! External collaborators consulted during succession.
//!
//! Every call goes through [`call_with_timeout`]: a collaborator that hangs
//! surfaces as a retryable `Timeout` instead of holding up the case. Hung
//! calls are abandoned, and the orchestrator's [`CallBudget`] stops making
//! new ones once too many are still out.

use crate::settlement::StepKind;
use chrono::{DateTime, Utc};
use deadhand_core::{BoundedCallError, CallBudget, CaseId, PrincipalId};
use deadhand_notify::NotificationService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{collaborator} did not answer within {timeout_secs}s")]
    Timeout {
        collaborator: &'static str,
        timeout_secs: u64,
    },

    #[error("{collaborator} failed: {reason}")]
    Failed {
        collaborator: &'static str,
        reason: String,
    },
}

/// Inbound report that a principal has died, from an external verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathVerificationEvent {
    pub principal_id: PrincipalId,
    pub verified_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub authorized: bool,
}

/// Validates the beneficiary allocation before assets move.
pub trait BeneficiaryTree: Send + Sync {
    fn validate(&self, principal: &PrincipalId) -> Result<bool, CollaboratorError>;
}

/// Confirms an executor is authorized under a legal document.
pub trait ExecutorAuth: Send + Sync {
    fn verify_authorization(
        &self,
        executor_id: &str,
        doc_id: &str,
    ) -> Result<Authorization, CollaboratorError>;
}

/// Side-effecting estate operations. Calls carry the case id so the
/// collaborator can deduplicate a retried step.
pub trait EstateOperations: Send + Sync {
    fn value_estate(&self, principal: &PrincipalId, case_id: &CaseId) -> Result<(), CollaboratorError>;

    fn fund_trust(&self, principal: &PrincipalId, case_id: &CaseId) -> Result<(), CollaboratorError>;

    fn reparent_assets(&self, principal: &PrincipalId, case_id: &CaseId) -> Result<(), CollaboratorError>;

    /// Carry out a forced liquidation for a deadlocked step. Returns a
    /// description of the action taken, for the audit log.
    fn liquidate(
        &self,
        principal: &PrincipalId,
        case_id: &CaseId,
        step: StepKind,
    ) -> Result<String, CollaboratorError>;
}

/// Everything the orchestrator consults. All read-only from its side.
#[derive(Clone)]
pub struct Collaborators {
    pub beneficiaries: Arc<dyn BeneficiaryTree>,
    pub executor_auth: Arc<dyn ExecutorAuth>,
    pub estate: Arc<dyn EstateOperations>,
    pub notifications: NotificationService,
}

/// Run `f` on its own thread and wait at most `timeout` for the answer.
///
/// A call that times out keeps running in the background and is counted
/// against `budget`; its result is discarded.
pub fn call_with_timeout<T, F>(
    budget: &CallBudget,
    collaborator: &'static str,
    timeout: Duration,
    f: F,
) -> Result<T, CollaboratorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CollaboratorError> + Send + 'static,
{
    match budget.call(collaborator, timeout, f) {
        Ok(result) => result,
        Err(BoundedCallError::TimedOut(_)) => Err(CollaboratorError::Timeout {
            collaborator,
            timeout_secs: timeout.as_secs(),
        }),
        Err(e) => Err(CollaboratorError::Failed {
            collaborator,
            reason: e.to_string(),
        }),
    }
}
