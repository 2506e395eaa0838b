//! Succession cases and their state machine.
//!
//! ```text
//! Monitoring -> DeathSuspected -> VerificationPending -> Verified
//!     -> SettlementInProgress -> Complete
//!
//! Monitoring | DeathSuspected | VerificationPending -> Aborted
//! ```
//!
//! A case can only be aborted before verification. Once `Verified`, only
//! forward progress is possible.

use crate::error::SuccessionError;
use crate::settlement::{Settlement, StepKind};
use chrono::{DateTime, Utc};
use deadhand_core::{CaseId, ChannelKind, PrincipalId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseState {
    Monitoring,
    DeathSuspected,
    VerificationPending,
    Verified,
    SettlementInProgress,
    Complete,
    Aborted,
}

impl CaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CaseState::Complete | CaseState::Aborted)
    }

    /// Still abortable by a sign of life.
    pub fn is_pre_verified(self) -> bool {
        matches!(
            self,
            CaseState::Monitoring | CaseState::DeathSuspected | CaseState::VerificationPending
        )
    }

    pub fn can_transition_to(self, next: CaseState) -> bool {
        use CaseState::*;
        match (self, next) {
            (Monitoring, DeathSuspected)
            | (DeathSuspected, VerificationPending)
            | (VerificationPending, Verified)
            | (Verified, SettlementInProgress)
            | (SettlementInProgress, Complete) => true,
            (from, Aborted) => from.is_pre_verified(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaseState::Monitoring => "monitoring",
            CaseState::DeathSuspected => "death suspected",
            CaseState::VerificationPending => "awaiting verification",
            CaseState::Verified => "verified",
            CaseState::SettlementInProgress => "settling",
            CaseState::Complete => "complete",
            CaseState::Aborted => "aborted",
        }
    }
}

/// What caused a case to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaseTrigger {
    LivenessEscalation {
        last_seen: DateTime<Utc>,
    },
    DeathVerification {
        verified_by: String,
        reported_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessionCase {
    pub id: CaseId,
    pub principal_id: PrincipalId,
    pub state: CaseState,
    /// Bumped whenever a verification attempt starts or ends without success
    pub epoch: u64,
    pub trigger: CaseTrigger,
    pub opened_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub settlement: Settlement,
    pub abort_reason: Option<String>,
}

impl SuccessionCase {
    pub fn new(principal_id: PrincipalId, trigger: CaseTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: CaseId::generate(&principal_id),
            principal_id,
            state: CaseState::Monitoring,
            epoch: 0,
            trigger,
            opened_at: now,
            verified_at: None,
            closed_at: None,
            settlement: Settlement::default(),
            abort_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: CaseState, now: DateTime<Utc>) -> Result<CaseState, SuccessionError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(SuccessionError::InvalidTransition { from, to: next });
        }

        match next {
            CaseState::VerificationPending => self.epoch += 1,
            CaseState::Verified => self.verified_at = Some(now),
            CaseState::Aborted => {
                self.epoch += 1;
                self.closed_at = Some(now);
            }
            CaseState::Complete => self.closed_at = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(from)
    }

    /// Reject requests issued against an earlier epoch.
    pub fn check_epoch(&self, epoch: u64) -> Result<(), SuccessionError> {
        if epoch != self.epoch {
            return Err(SuccessionError::StaleTransition {
                case_id: self.id.clone(),
                expected: self.epoch,
                actual: epoch,
            });
        }
        Ok(())
    }

    pub fn require_state(&self, state: CaseState, operation: &'static str) -> Result<(), SuccessionError> {
        if self.state != state {
            return Err(SuccessionError::WrongState {
                case_id: self.id.clone(),
                state: self.state,
                operation,
            });
        }
        Ok(())
    }
}

/// Audit log payloads. Every state change is appended before it is stored.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SuccessionEvent<'a> {
    DeathVerificationReceived {
        principal_id: &'a PrincipalId,
        verified_by: &'a str,
        reported_at: DateTime<Utc>,
    },
    CaseTransition {
        case_id: &'a CaseId,
        principal_id: &'a PrincipalId,
        from: CaseState,
        to: CaseState,
        epoch: u64,
        reason: &'a str,
    },
    ChannelVerified {
        case_id: &'a CaseId,
        epoch: u64,
        channel: ChannelKind,
        expires_at: Option<DateTime<Utc>>,
    },
    ShardAccepted {
        case_id: &'a CaseId,
        epoch: u64,
        index: u8,
    },
    VerificationRejected {
        case_id: &'a CaseId,
        epoch: u64,
        reason: &'a str,
    },
    StepCompleted {
        case_id: &'a CaseId,
        step: StepKind,
        attempts: u32,
    },
    StepFailed {
        case_id: &'a CaseId,
        step: StepKind,
        reason: &'a str,
    },
    ForceLiquidation {
        case_id: &'a CaseId,
        step: StepKind,
        blocked_days: i64,
        action: &'a str,
    },
}
