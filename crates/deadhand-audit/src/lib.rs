//! Deadhand Audit Module
//!
//! Append-only event log where every entry commits to its predecessor:
//!
//! ```text
//! hash(i) = SHA-256(canonical(entry_i) || hash(i-1)),   hash(0) = GENESIS
//! ```
//!
//! Entries are numbered from 1; position 0 is the genesis hash. There is no
//! update or delete. Verification recomputes every hash from the raw
//! payloads, so a rewritten payload and a rewritten stored hash are both
//! caught at the entry where they happened.
//!
//! A detected break halts the chain: appends are refused until an operator
//! acknowledges it.

pub mod chain;
pub mod entry;

pub use chain::AuditChain;
pub use entry::{verify_entries, AuditEntry, GENESIS_HASH};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("Audit chain integrity violated at entry {sequence}")]
    IntegrityViolation { sequence: u64 },

    #[error("Audit chain halted after integrity violation at entry {sequence}; operator acknowledgement required")]
    Halted { sequence: u64 },

    #[error("No integrity violation to acknowledge")]
    NothingToAcknowledge,

    #[error("Payload serialization failed: {0}")]
    Serialization(String),
}
