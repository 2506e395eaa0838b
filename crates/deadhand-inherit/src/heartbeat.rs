//! Dead-man's-switch liveness evaluation.
//!
//! The escalation state is a pure function of the time since the last
//! heartbeat, compared against the principal's own `LivenessPolicy`:
//!
//! ```text
//! |--- Active ---|--- Overdue ---|--- Alerting ---|--- SuccessionPending
//! 0        overdue_after    alert_after    succession_after
//! ```
//!
//! Only the heartbeat timestamp is stored, so a restarted process computes
//! the same state it would have computed before.

use chrono::{DateTime, Duration, Utc};
use deadhand_core::{
    KeyedLocks, LivenessPolicy, PolicyError, Principal, PrincipalId, Repository, RepositoryError,
};
use deadhand_notify::NotificationLevel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors from liveness tracking.
#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("Unknown principal: {0}")]
    UnknownPrincipal(PrincipalId),

    #[error("Heartbeat for {principal} at {attempted} is older than recorded {last_seen}")]
    ReplayedHeartbeat {
        principal: PrincipalId,
        attempted: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },

    #[error("Principal {0} is archived")]
    Archived(PrincipalId),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Escalation state derived from silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    Active,
    Overdue,
    Alerting,
    SuccessionPending,
}

impl LivenessState {
    /// Which reminder, if any, the principal should receive.
    pub fn to_notification_level(self) -> Option<NotificationLevel> {
        match self {
            LivenessState::Active => None,
            LivenessState::Overdue => Some(NotificationLevel::Reminder),
            LivenessState::Alerting => Some(NotificationLevel::Urgent),
            LivenessState::SuccessionPending => Some(NotificationLevel::Critical),
        }
    }
}

/// Last confirmed-alive timestamp for a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub principal_id: PrincipalId,
    pub last_seen: DateTime<Utc>,
    /// Accepted pings since enrollment
    pub pings: u64,
}

/// Point-in-time liveness of one principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessStatus {
    pub principal_id: PrincipalId,
    pub state: LivenessState,
    pub last_seen: DateTime<Utc>,
    /// Silence so far (never negative)
    pub elapsed: Duration,
    /// Time until the next state, `None` once succession is pending
    pub next_escalation_in: Option<Duration>,
    /// Time until succession may begin (zero once reached)
    pub until_succession: Duration,
}

/// Evaluate liveness for one heartbeat.
///
/// Pure function: the caller supplies `now`. Thresholds are inclusive, so
/// exactly `overdue_after` of silence is already `Overdue`.
pub fn evaluate_liveness(
    principal_id: &PrincipalId,
    policy: &LivenessPolicy,
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
) -> LivenessStatus {
    // A heartbeat stamped ahead of our clock counts as zero silence
    let elapsed = (now - last_seen).max(Duration::zero());

    let (state, next_threshold) = if elapsed >= policy.succession_after {
        (LivenessState::SuccessionPending, None)
    } else if elapsed >= policy.alert_after {
        (LivenessState::Alerting, Some(policy.succession_after))
    } else if elapsed >= policy.overdue_after {
        (LivenessState::Overdue, Some(policy.alert_after))
    } else {
        (LivenessState::Active, Some(policy.overdue_after))
    };

    LivenessStatus {
        principal_id: principal_id.clone(),
        state,
        last_seen,
        elapsed,
        next_escalation_in: next_threshold.map(|t| t - elapsed),
        until_succession: (policy.succession_after - elapsed).max(Duration::zero()),
    }
}

/// Batch evaluate many principals.
///
/// Returns statuses sorted by urgency (most urgent first), ties broken by
/// how close each principal is to succession.
pub fn evaluate_batch(
    entries: &[(LivenessPolicy, Heartbeat)],
    now: DateTime<Utc>,
) -> Vec<LivenessStatus> {
    let mut statuses: Vec<LivenessStatus> = entries
        .iter()
        .map(|(policy, hb)| evaluate_liveness(&hb.principal_id, policy, hb.last_seen, now))
        .collect();

    statuses.sort_by(|a, b| {
        b.state
            .cmp(&a.state)
            .then(a.until_succession.cmp(&b.until_succession))
            .then(a.principal_id.cmp(&b.principal_id))
    });

    statuses
}

/// Owns heartbeats and enrollment records.
pub struct LivenessMonitor {
    principals: Arc<dyn Repository<Principal>>,
    heartbeats: Arc<dyn Repository<Heartbeat>>,
    locks: KeyedLocks,
}

impl LivenessMonitor {
    pub fn new(
        principals: Arc<dyn Repository<Principal>>,
        heartbeats: Arc<dyn Repository<Heartbeat>>,
    ) -> Self {
        Self {
            principals,
            heartbeats,
            locks: KeyedLocks::new(),
        }
    }

    /// Enroll (or re-configure) a principal. Enrollment counts as the first
    /// heartbeat; re-enrolling keeps the existing heartbeat.
    pub fn enroll(&self, principal: Principal) -> Result<(), LivenessError> {
        principal.validate()?;
        self.locks.with_lock(principal.id.as_str(), || {
            self.principals.save(principal.id.as_str(), &principal)?;
            if self.heartbeats.load(principal.id.as_str())?.is_none() {
                self.heartbeats.save(
                    principal.id.as_str(),
                    &Heartbeat {
                        principal_id: principal.id.clone(),
                        last_seen: principal.enrolled_at,
                        pings: 0,
                    },
                )?;
            }
            log::info!("Enrolled principal {}", principal.id);
            Ok(())
        })
    }

    /// Replace a principal's liveness durations.
    pub fn update_policy(&self, id: &PrincipalId, policy: LivenessPolicy) -> Result<(), LivenessError> {
        policy.validate()?;
        self.locks.with_lock(id.as_str(), || {
            let mut principal = self.principal(id)?;
            principal.liveness = policy;
            self.principals.save(id.as_str(), &principal)?;
            Ok(())
        })
    }

    /// Record a check-in at `at`.
    ///
    /// Pings are last-write-wins on a monotonically increasing timestamp: a
    /// repeat of the stored timestamp is a no-op and an older one is
    /// rejected as a replay.
    pub fn ping(&self, id: &PrincipalId, at: DateTime<Utc>) -> Result<Heartbeat, LivenessError> {
        self.locks.with_lock(id.as_str(), || {
            let principal = self.principal(id)?;
            if principal.archived {
                return Err(LivenessError::Archived(id.clone()));
            }

            let current = self.heartbeats.load(id.as_str())?;
            if let Some(hb) = &current {
                if at < hb.last_seen {
                    log::warn!(
                        "Rejected replayed heartbeat for {} ({} < {})",
                        id,
                        at,
                        hb.last_seen
                    );
                    return Err(LivenessError::ReplayedHeartbeat {
                        principal: id.clone(),
                        attempted: at,
                        last_seen: hb.last_seen,
                    });
                }
                if at == hb.last_seen {
                    return Ok(hb.clone());
                }
            }

            let heartbeat = Heartbeat {
                principal_id: id.clone(),
                last_seen: at,
                pings: current.map(|hb| hb.pings).unwrap_or(0) + 1,
            };
            self.heartbeats.save(id.as_str(), &heartbeat)?;
            log::debug!("Heartbeat from {} at {}", id, at);
            Ok(heartbeat)
        })
    }

    /// Current escalation state, recomputed from the stored heartbeat.
    pub fn get_status(&self, id: &PrincipalId, now: DateTime<Utc>) -> Result<LivenessStatus, LivenessError> {
        let principal = self.principal(id)?;
        let last_seen = self.last_heartbeat(id)?.unwrap_or(principal.enrolled_at);
        Ok(evaluate_liveness(id, &principal.liveness, last_seen, now))
    }

    pub fn last_heartbeat(&self, id: &PrincipalId) -> Result<Option<DateTime<Utc>>, LivenessError> {
        Ok(self.heartbeats.load(id.as_str())?.map(|hb| hb.last_seen))
    }

    pub fn principal(&self, id: &PrincipalId) -> Result<Principal, LivenessError> {
        self.principals
            .load(id.as_str())?
            .ok_or_else(|| LivenessError::UnknownPrincipal(id.clone()))
    }

    pub fn principal_ids(&self) -> Result<Vec<PrincipalId>, LivenessError> {
        Ok(self
            .principals
            .ids()?
            .into_iter()
            .map(PrincipalId::new)
            .collect())
    }

    /// Status of every non-archived principal, most urgent first.
    pub fn statuses(&self, now: DateTime<Utc>) -> Result<Vec<LivenessStatus>, LivenessError> {
        let mut entries = Vec::new();
        for id in self.principal_ids()? {
            let principal = self.principal(&id)?;
            if principal.archived {
                continue;
            }
            let heartbeat = self.heartbeats.load(id.as_str())?.unwrap_or(Heartbeat {
                principal_id: id.clone(),
                last_seen: principal.enrolled_at,
                pings: 0,
            });
            entries.push((principal.liveness, heartbeat));
        }
        Ok(evaluate_batch(&entries, now))
    }

    /// Mark a principal archived once its succession has completed.
    pub fn archive(&self, id: &PrincipalId) -> Result<(), LivenessError> {
        self.locks.with_lock(id.as_str(), || {
            let mut principal = self.principal(id)?;
            if !principal.archived {
                principal.archived = true;
                self.principals.save(id.as_str(), &principal)?;
                log::info!("Archived principal {}", id);
            }
            Ok(())
        })
    }
}
