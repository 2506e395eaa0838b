//! The append-only chain.
//!
//! All mutation goes through one mutex per chain, so appends are applied in
//! the order they acquire it and never interleave.
//!
//! An operator acknowledgement excuses exactly one broken entry. Everything
//! after it is still verified, starting from the link stored on the entry
//! that follows the break.

use crate::entry::{verify_from, AuditEntry, GENESIS_HASH};
use crate::AuditError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

const ACKNOWLEDGED_EVENT: &str = "integrity_break_acknowledged";

#[derive(Debug, Default)]
struct ChainState {
    entries: Vec<AuditEntry>,
    /// First unacknowledged broken entry found by `ensure_intact` or `restore`
    halted_at: Option<u64>,
}

impl ChainState {
    fn push<P: Serialize + ?Sized>(
        &mut self,
        payload: &P,
        recorded_at: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| AuditError::Serialization(e.to_string()))?;
        let (sequence, prev_hash) = match self.entries.last() {
            Some(last) => (last.sequence + 1, last.hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };
        let entry = AuditEntry::seal(sequence, recorded_at, payload, prev_hash);
        self.entries.push(entry.clone());
        Ok(entry)
    }
}

/// Whether a later entry records an operator acknowledgement of `sequence`.
fn is_acknowledged(entries: &[AuditEntry], sequence: u64) -> bool {
    entries.iter().any(|e| {
        e.sequence > sequence
            && e.event() == Some(ACKNOWLEDGED_EVENT)
            && e.payload.get("sequence").and_then(|v| v.as_u64()) == Some(sequence)
    })
}

/// First broken entry that no acknowledgement covers.
///
/// After an acknowledged break at `k`, verification resumes at `k + 1`
/// from the link that entry carries, so tampering anywhere past the break
/// is still found.
fn unacknowledged_break(entries: &[AuditEntry]) -> Option<u64> {
    let mut start = 0;
    let mut prev = GENESIS_HASH.to_string();
    loop {
        let sequence = verify_from(entries, start, &prev).err()?;
        if !is_acknowledged(entries, sequence) {
            return Some(sequence);
        }
        // Sequences start at 1, so the entry after the break sits at `sequence`
        let next = sequence as usize;
        let entry = entries.get(next)?;
        start = next;
        prev = entry.prev_hash.clone();
    }
}

#[derive(Debug, Default)]
pub struct AuditChain {
    state: Mutex<ChainState>,
}

impl AuditChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a chain from persisted entries.
    ///
    /// A chain that fails verification comes back halted, unless the chain
    /// itself records an operator acknowledgement of every break in it.
    pub fn restore(entries: Vec<AuditEntry>) -> Self {
        let halted_at = unacknowledged_break(&entries);
        match halted_at {
            Some(sequence) => log::error!("Restored audit chain is broken at entry {}", sequence),
            None => {
                if let Err(sequence) = verify_from(&entries, 0, GENESIS_HASH) {
                    log::warn!("Restored audit chain has an acknowledged break at entry {}", sequence);
                }
            }
        }
        Self {
            state: Mutex::new(ChainState { entries, halted_at }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        // Entries are only pushed once fully sealed
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a payload, stamped with the current time.
    pub fn append<P: Serialize + ?Sized>(&self, payload: &P) -> Result<AuditEntry, AuditError> {
        self.append_at(payload, Utc::now())
    }

    /// Append a payload with an explicit timestamp.
    pub fn append_at<P: Serialize + ?Sized>(
        &self,
        payload: &P,
        recorded_at: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditError> {
        let mut state = self.lock();
        if let Some(sequence) = state.halted_at {
            return Err(AuditError::Halted { sequence });
        }
        state.push(payload, recorded_at)
    }

    /// Recompute every hash from genesis. Pure: does not change chain state.
    ///
    /// Reports the first break whether or not it has been acknowledged.
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        let state = self.lock();
        verify_from(&state.entries, 0, GENESIS_HASH)
            .map_err(|sequence| AuditError::IntegrityViolation { sequence })
    }

    /// Verify, and halt the chain if a break is found that an operator has
    /// not already acknowledged.
    pub fn ensure_intact(&self) -> Result<(), AuditError> {
        let mut state = self.lock();
        match unacknowledged_break(&state.entries) {
            None => Ok(()),
            Some(sequence) => {
                if state.halted_at != Some(sequence) {
                    log::error!(
                        "Audit chain integrity violated at entry {}; halting appends",
                        sequence
                    );
                }
                state.halted_at = Some(sequence);
                Err(AuditError::IntegrityViolation { sequence })
            }
        }
    }

    /// Lift a halt. The acknowledgement itself becomes the next entry.
    pub fn acknowledge_break(&self, operator: &str) -> Result<AuditEntry, AuditError> {
        let mut state = self.lock();
        let sequence = state.halted_at.ok_or(AuditError::NothingToAcknowledge)?;
        let entry = state.push(
            &serde_json::json!({
                "event": ACKNOWLEDGED_EVENT,
                "sequence": sequence,
                "operator": operator,
            }),
            Utc::now(),
        )?;
        state.halted_at = None;
        log::warn!(
            "Operator {} acknowledged audit chain break at entry {}",
            operator,
            sequence
        );
        Ok(entry)
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted_at.is_some()
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().entries.clone()
    }

    /// Entries with a sequence number greater than `sequence`.
    pub fn entries_after(&self, sequence: u64) -> Vec<AuditEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.sequence > sequence)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash of the newest entry, or the genesis hash for an empty chain.
    pub fn head_hash(&self) -> String {
        self.lock()
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string())
    }
}
