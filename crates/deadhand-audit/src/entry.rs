//! Audit entry types and hashing

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash that the first entry links to.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// An audit log entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain, starting at 1
    pub sequence: u64,

    /// When the entry was appended
    pub recorded_at: DateTime<Utc>,

    /// The event itself
    pub payload: Value,

    /// Hash of the previous entry (GENESIS_HASH for the first)
    pub prev_hash: String,

    /// Hash of this entry
    pub hash: String,
}

impl AuditEntry {
    pub(crate) fn seal(
        sequence: u64,
        recorded_at: DateTime<Utc>,
        payload: Value,
        prev_hash: String,
    ) -> Self {
        let hash = compute_hash(sequence, &recorded_at, &payload, &prev_hash);
        Self {
            sequence,
            recorded_at,
            payload,
            prev_hash,
            hash,
        }
    }

    /// Event name, when the payload is a tagged object with an `event` field.
    pub fn event(&self) -> Option<&str> {
        self.payload.get("event").and_then(Value::as_str)
    }
}

/// Recompute the chain from genesis.
///
/// Returns the sequence number of the first entry whose position, link, or
/// hash does not match, independent of any hash stored on later entries.
pub fn verify_entries(entries: &[AuditEntry]) -> Result<(), u64> {
    verify_from(entries, 0, GENESIS_HASH)
}

/// Recompute `entries[start..]`, where `entries[start]` must link to
/// `prev_hash`.
pub(crate) fn verify_from(entries: &[AuditEntry], start: usize, prev_hash: &str) -> Result<(), u64> {
    let mut prev = prev_hash.to_string();

    for (position, entry) in entries.iter().enumerate().skip(start) {
        let expected_sequence = position as u64 + 1;
        let recomputed = compute_hash(
            expected_sequence,
            &entry.recorded_at,
            &entry.payload,
            &prev,
        );

        if entry.sequence != expected_sequence || entry.prev_hash != prev || entry.hash != recomputed
        {
            return Err(expected_sequence);
        }
        prev = recomputed;
    }

    Ok(())
}

fn compute_hash(sequence: u64, recorded_at: &DateTime<Utc>, payload: &Value, prev_hash: &str) -> String {
    let mut body = String::new();
    write_canonical(
        &serde_json::json!({
            "sequence": sequence,
            "recorded_at": recorded_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            "payload": payload,
        }),
        &mut body,
    );

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize with object keys sorted at every level, whatever map ordering
/// serde_json was built with.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
