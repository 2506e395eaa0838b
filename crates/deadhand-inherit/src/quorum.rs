//! Multi-channel identity verification.
//!
//! A case needs confirmations from at least `QuorumPolicy::minimum` distinct
//! channels, each still inside its verification window. Confirmations
//! expire; a lapsed channel stops counting until it is confirmed again.
//!
//! Quorum state is tagged with the case epoch it was opened for, so a
//! confirmation gathered for an aborted attempt can never satisfy a later
//! one.

use chrono::{DateTime, Utc};
use deadhand_core::{CaseId, ChannelKind, KeyedLocks, QuorumPolicy, Repository, RepositoryError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("No verification open for case {0}")]
    UnknownCase(CaseId),

    #[error("Channel {channel} is not configured for case {case_id}")]
    UnknownChannel { case_id: CaseId, channel: ChannelKind },

    #[error("Verification for {case_id} is at epoch {expected}, request carried {actual}")]
    StaleEpoch {
        case_id: CaseId,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// One channel's confirmation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationChannel {
    pub kind: ChannelKind,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl VerificationChannel {
    fn unverified(kind: ChannelKind) -> Self {
        Self {
            kind,
            verified: false,
            verified_at: None,
            expires_at: None,
        }
    }

    /// Verified and not yet expired at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.verified && self.expires_at.is_some_and(|expires| now < expires)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumState {
    pub case_id: CaseId,
    pub epoch: u64,
    pub policy: QuorumPolicy,
    pub channels: Vec<VerificationChannel>,
}

impl QuorumState {
    pub fn live_count(&self, now: DateTime<Utc>) -> usize {
        self.channels.iter().filter(|c| c.is_live(now)).count()
    }

    pub fn is_met(&self, now: DateTime<Utc>) -> bool {
        self.live_count(now) >= self.policy.minimum
    }

    pub fn status(&self, now: DateTime<Utc>) -> QuorumStatus {
        let verified = self.live_count(now);
        QuorumStatus {
            epoch: self.epoch,
            verified,
            required: self.policy.minimum,
            met: verified >= self.policy.minimum,
            awaiting: self
                .channels
                .iter()
                .filter(|c| !c.is_live(now))
                .map(|c| c.kind)
                .collect(),
        }
    }
}

/// Snapshot of a case's verification progress.
///
/// The default (nothing verified, nothing required, not met) is what an
/// unknown case reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuorumStatus {
    pub epoch: u64,
    pub verified: usize,
    pub required: usize,
    pub met: bool,
    /// Channels not currently counting (never confirmed, or lapsed)
    pub awaiting: Vec<ChannelKind>,
}

pub struct QuorumVerifier {
    states: Arc<dyn Repository<QuorumState>>,
    locks: KeyedLocks,
}

impl QuorumVerifier {
    pub fn new(states: Arc<dyn Repository<QuorumState>>) -> Self {
        Self {
            states,
            locks: KeyedLocks::new(),
        }
    }

    /// Start (or restart at a new epoch) verification for a case. Any
    /// confirmations from an earlier epoch are discarded.
    pub fn open(
        &self,
        case_id: &CaseId,
        epoch: u64,
        policy: QuorumPolicy,
        channels: &[ChannelKind],
    ) -> Result<QuorumState, QuorumError> {
        self.locks.with_lock(case_id.as_str(), || {
            let state = QuorumState {
                case_id: case_id.clone(),
                epoch,
                policy,
                channels: channels
                    .iter()
                    .copied()
                    .map(VerificationChannel::unverified)
                    .collect(),
            };
            self.states.save(case_id.as_str(), &state)?;
            log::info!(
                "Opened verification for {} at epoch {} ({} of {} channels required)",
                case_id,
                epoch,
                policy.minimum,
                channels.len()
            );
            Ok(state)
        })
    }

    /// Record a confirmation. Re-confirming a channel refreshes its window.
    pub fn verify_channel(
        &self,
        case_id: &CaseId,
        epoch: u64,
        kind: ChannelKind,
        now: DateTime<Utc>,
    ) -> Result<VerificationChannel, QuorumError> {
        self.locks.with_lock(case_id.as_str(), || {
            let mut state = self.load(case_id)?;
            if state.epoch != epoch {
                return Err(QuorumError::StaleEpoch {
                    case_id: case_id.clone(),
                    expected: state.epoch,
                    actual: epoch,
                });
            }

            let window = state.policy.verification_window;
            let channel = state
                .channels
                .iter_mut()
                .find(|c| c.kind == kind)
                .ok_or_else(|| QuorumError::UnknownChannel {
                    case_id: case_id.clone(),
                    channel: kind,
                })?;
            channel.verified = true;
            channel.verified_at = Some(now);
            channel.expires_at = Some(now + window);
            let confirmed = channel.clone();

            self.states.save(case_id.as_str(), &state)?;
            log::info!("Channel {} confirmed for {}", kind, case_id);
            Ok(confirmed)
        })
    }

    /// Whether enough live confirmations exist at `now`. Unknown cases are
    /// never met.
    pub fn is_quorum_met(&self, case_id: &CaseId, now: DateTime<Utc>) -> bool {
        self.status(case_id, now).met
    }

    /// Best-effort progress snapshot; storage errors read as "nothing verified".
    pub fn status(&self, case_id: &CaseId, now: DateTime<Utc>) -> QuorumStatus {
        match self.states.load(case_id.as_str()) {
            Ok(Some(state)) => state.status(now),
            Ok(None) => QuorumStatus::default(),
            Err(e) => {
                log::warn!("Could not load quorum state for {}: {}", case_id, e);
                QuorumStatus::default()
            }
        }
    }

    pub fn state(&self, case_id: &CaseId) -> Result<Option<QuorumState>, QuorumError> {
        Ok(self.states.load(case_id.as_str())?)
    }

    /// Clear lapsed confirmations, returning the channels that need to be
    /// asked again.
    pub fn sweep_expired(
        &self,
        case_id: &CaseId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChannelKind>, QuorumError> {
        self.locks.with_lock(case_id.as_str(), || {
            let mut state = self.load(case_id)?;
            let mut lapsed = Vec::new();
            for channel in state.channels.iter_mut() {
                if channel.verified && !channel.is_live(now) {
                    channel.verified = false;
                    lapsed.push(channel.kind);
                }
            }
            if !lapsed.is_empty() {
                self.states.save(case_id.as_str(), &state)?;
                log::info!("Confirmations lapsed for {}: {:?}", case_id, lapsed);
            }
            Ok(lapsed)
        })
    }

    fn load(&self, case_id: &CaseId) -> Result<QuorumState, QuorumError> {
        self.states
            .load(case_id.as_str())?
            .ok_or_else(|| QuorumError::UnknownCase(case_id.clone()))
    }
}
