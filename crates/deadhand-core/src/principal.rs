//! Enrolled principals and the policies that govern them.
//!
//! Every duration and threshold lives on the principal it applies to, so two
//! principals can run on completely different schedules inside one process.

use crate::ids::PrincipalId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid liveness policy: {0}")]
    InvalidLiveness(String),

    #[error("Invalid quorum policy: {0}")]
    InvalidQuorum(String),

    #[error("Unknown channel kind: {0}")]
    UnknownChannel(String),

    #[error("Invalid principal: {0}")]
    InvalidPrincipal(String),
}

/// An independent channel through which an identity claim can be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    Nostr,
    Phone,
    Attorney,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::Nostr,
        ChannelKind::Phone,
        ChannelKind::Attorney,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::Nostr => "nostr",
            ChannelKind::Phone => "phone",
            ChannelKind::Attorney => "attorney",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(ChannelKind::Email),
            "sms" => Ok(ChannelKind::Sms),
            "nostr" => Ok(ChannelKind::Nostr),
            "phone" => Ok(ChannelKind::Phone),
            "attorney" => Ok(ChannelKind::Attorney),
            other => Err(PolicyError::UnknownChannel(other.to_string())),
        }
    }
}

/// Liveness escalation durations, measured from the last heartbeat.
///
/// The three durations are configured independently. The only constraint
/// is that they are positive and strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessPolicy {
    /// Silence after which the principal is `Overdue` (the check-in interval).
    #[serde(with = "crate::duration_secs")]
    pub overdue_after: Duration,
    /// Silence after which the principal is `Alerting`.
    #[serde(with = "crate::duration_secs")]
    pub alert_after: Duration,
    /// Silence after which succession may begin.
    #[serde(with = "crate::duration_secs")]
    pub succession_after: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::from_days(90, 120, 180)
    }
}

impl LivenessPolicy {
    pub fn from_days(overdue: i64, alert: i64, succession: i64) -> Self {
        Self {
            overdue_after: Duration::days(overdue),
            alert_after: Duration::days(alert),
            succession_after: Duration::days(succession),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.overdue_after <= Duration::zero() {
            return Err(PolicyError::InvalidLiveness(
                "overdue_after must be positive".into(),
            ));
        }
        if self.alert_after <= self.overdue_after {
            return Err(PolicyError::InvalidLiveness(
                "alert_after must be greater than overdue_after".into(),
            ));
        }
        if self.succession_after <= self.alert_after {
            return Err(PolicyError::InvalidLiveness(
                "succession_after must be greater than alert_after".into(),
            ));
        }
        Ok(())
    }
}

/// How many independent channels must confirm, and for how long each
/// confirmation stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub minimum: usize,
    #[serde(with = "crate::duration_secs")]
    pub verification_window: Duration,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            minimum: 2,
            verification_window: Duration::hours(72),
        }
    }
}

impl QuorumPolicy {
    /// Validate against the number of configured channels.
    pub fn validate(&self, channel_count: usize) -> Result<(), PolicyError> {
        if self.minimum == 0 {
            return Err(PolicyError::InvalidQuorum("minimum must be at least 1".into()));
        }
        if self.minimum > channel_count {
            return Err(PolicyError::InvalidQuorum(format!(
                "minimum {} exceeds {} configured channels",
                self.minimum, channel_count
            )));
        }
        if self.verification_window <= Duration::zero() {
            return Err(PolicyError::InvalidQuorum(
                "verification_window must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Who is expected to act as executor, and under which document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorDesignation {
    pub executor_id: String,
    pub doc_id: String,
}

/// An enrolled principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub liveness: LivenessPolicy,
    pub quorum: QuorumPolicy,
    pub channels: Vec<ChannelKind>,
    pub executor: Option<ExecutorDesignation>,
    pub enrolled_at: DateTime<Utc>,
    /// Set once a succession case for this principal completes.
    #[serde(default)]
    pub archived: bool,
}

impl Principal {
    pub fn new(id: impl Into<String>, channels: Vec<ChannelKind>, enrolled_at: DateTime<Utc>) -> Self {
        Self {
            id: PrincipalId::new(id),
            liveness: LivenessPolicy::default(),
            quorum: QuorumPolicy::default(),
            channels,
            executor: None,
            enrolled_at,
            archived: false,
        }
    }

    pub fn with_liveness(mut self, liveness: LivenessPolicy) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_executor(mut self, executor_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        self.executor = Some(ExecutorDesignation {
            executor_id: executor_id.into(),
            doc_id: doc_id.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.id.as_str().is_empty() {
            return Err(PolicyError::InvalidPrincipal("id must not be empty".into()));
        }
        let mut channels = self.channels.clone();
        channels.sort();
        channels.dedup();
        if channels.len() != self.channels.len() {
            return Err(PolicyError::InvalidPrincipal(
                "verification channels must be distinct".into(),
            ));
        }
        self.liveness.validate()?;
        self.quorum.validate(self.channels.len())
    }
}
