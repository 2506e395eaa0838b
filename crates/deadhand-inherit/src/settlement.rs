//! Settlement steps and deadlock enforcement.
//!
//! Once a case is verified the estate is settled in a fixed order:
//!
//! 1. Valuation
//! 2. Executor authorization
//! 3. Trust funding
//! 4. Asset re-parenting
//!
//! A step that stays blocked (refused or repeatedly failing) for longer
//! than the deadlock deadline is force-resolved by liquidation so the
//! estate cannot stall indefinitely.

use crate::error::SuccessionError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default deadlock deadline, in days.
pub const DEFAULT_DEADLOCK_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Valuation,
    ExecutorAuthorization,
    TrustFunding,
    AssetReparenting,
}

impl StepKind {
    /// Execution order.
    pub const ORDER: [StepKind; 4] = [
        StepKind::Valuation,
        StepKind::ExecutorAuthorization,
        StepKind::TrustFunding,
        StepKind::AssetReparenting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Valuation => "valuation",
            StepKind::ExecutorAuthorization => "executor_authorization",
            StepKind::TrustFunding => "trust_funding",
            StepKind::AssetReparenting => "asset_reparenting",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    FailedRetryable,
    Done,
    ForceResolved,
}

impl StepStatus {
    /// Done or force-resolved; later steps may proceed.
    pub fn is_resolved(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::ForceResolved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementStep {
    pub kind: StepKind,
    pub status: StepStatus,
    pub attempts: u32,
    /// First time this step was found unable to proceed
    pub blocked_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Recorded liquidation action, for force-resolved steps
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SettlementStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            attempts: 0,
            blocked_since: None,
            last_error: None,
            resolution: None,
            resolved_at: None,
        }
    }

    /// Start an attempt.
    pub fn begin(&mut self) {
        if !self.status.is_resolved() {
            self.status = StepStatus::InProgress;
            self.attempts += 1;
        }
    }

    /// The step ran but a gate refused it (e.g. unauthorized executor).
    /// The deadlock clock starts at the first refusal and keeps running.
    pub fn block(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.status = StepStatus::InProgress;
        self.blocked_since.get_or_insert(now);
        self.last_error = Some(reason.into());
    }

    /// A collaborator failed or timed out; safe to retry.
    pub fn fail_retryable(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.status = StepStatus::FailedRetryable;
        self.blocked_since.get_or_insert(now);
        self.last_error = Some(reason.into());
    }

    pub fn force_resolve(&mut self, now: DateTime<Utc>, action: impl Into<String>) {
        self.status = StepStatus::ForceResolved;
        self.resolution = Some(action.into());
        self.resolved_at = Some(now);
    }

    /// How long this step has been blocked at `now`.
    pub fn blocked_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.blocked_since.map(|since| now - since)
    }
}

/// The ordered settlement plan for one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub steps: Vec<SettlementStep>,
}

impl Default for Settlement {
    fn default() -> Self {
        Self {
            steps: StepKind::ORDER.iter().copied().map(SettlementStep::new).collect(),
        }
    }
}

impl Settlement {
    pub fn step(&self, kind: StepKind) -> Option<&SettlementStep> {
        self.steps.iter().find(|s| s.kind == kind)
    }

    /// Index of the first step not yet resolved.
    pub fn next_unresolved(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.status.is_resolved())
    }

    pub fn is_complete(&self) -> bool {
        self.next_unresolved().is_none()
    }

    /// Mark `kind` done. Every earlier step must already be resolved, and a
    /// step that was force-resolved stays that way.
    pub fn mark_done(&mut self, kind: StepKind, now: DateTime<Utc>) -> Result<(), SuccessionError> {
        let index = self
            .steps
            .iter()
            .position(|s| s.kind == kind)
            .ok_or(SuccessionError::OutOfOrder {
                step: kind,
                waiting_on: kind,
            })?;

        if let Some(blocking) = self.steps[..index].iter().find(|s| !s.status.is_resolved()) {
            return Err(SuccessionError::OutOfOrder {
                step: kind,
                waiting_on: blocking.kind,
            });
        }

        let step = &mut self.steps[index];
        match step.status {
            StepStatus::Done => Ok(()),
            StepStatus::ForceResolved => Err(SuccessionError::DeadlockExceeded {
                step: kind,
                blocked_days: step
                    .blocked_since
                    .zip(step.resolved_at)
                    .map(|(since, at)| (at - since).num_days())
                    .unwrap_or_default(),
            }),
            _ => {
                step.status = StepStatus::Done;
                step.resolved_at = Some(now);
                step.last_error = None;
                Ok(())
            }
        }
    }
}

/// What the enforcer decided for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidationDecision {
    /// Not blocked (or already resolved)
    Clear,
    Waiting { days_remaining: i64 },
    ForceLiquidation { blocked_days: i64 },
}

/// Forces a blocked step to resolve once it has been stuck past the
/// deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidationEnforcer {
    pub deadline: Duration,
}

impl Default for LiquidationEnforcer {
    fn default() -> Self {
        Self::from_days(DEFAULT_DEADLOCK_DAYS)
    }
}

impl LiquidationEnforcer {
    pub fn from_days(days: i64) -> Self {
        Self {
            deadline: Duration::days(days),
        }
    }

    pub fn check(&self, step: &SettlementStep, now: DateTime<Utc>) -> LiquidationDecision {
        if step.status.is_resolved() {
            return LiquidationDecision::Clear;
        }
        let Some(blocked) = step.blocked_for(now) else {
            return LiquidationDecision::Clear;
        };

        if blocked >= self.deadline {
            LiquidationDecision::ForceLiquidation {
                blocked_days: blocked.num_days(),
            }
        } else {
            LiquidationDecision::Waiting {
                days_remaining: ceil_days(self.deadline - blocked),
            }
        }
    }
}

fn ceil_days(d: Duration) -> i64 {
    let whole = d.num_days();
    if d > Duration::days(whole) {
        whole + 1
    } else {
        whole
    }
}
