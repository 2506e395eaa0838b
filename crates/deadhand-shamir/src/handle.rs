//! Split metadata for validating shards and reconstructions.
//!
//! A `SecretHandle` is safe to store next to the case it protects: it holds
//! the split parameters and salted SHA-256 digests, never the secret or any
//! shard value.

use crate::shamir::Shard;
use crate::ShamirError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SHARD_TAG: &[u8] = b"deadhand/shard/v1";
const SECRET_TAG: &[u8] = b"deadhand/secret/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretHandle {
    /// Random id shared by every shard of this split (hex)
    pub split_id: String,
    /// Total shards generated (n)
    pub total: u8,
    /// Shards required to reconstruct (t)
    pub threshold: u8,
    /// Length of the secret in bytes
    pub secret_len: usize,
    /// Salted digest of the secret (hex)
    pub secret_digest: String,
    /// Salted digest of shard `i` at position `i - 1` (hex)
    pub shard_digests: Vec<String>,
}

impl SecretHandle {
    /// Check a single shard against this split: split id, index range,
    /// value length and digest.
    pub fn check_shard(&self, shard: &Shard) -> Result<(), ShamirError> {
        if shard.split_id != self.split_id {
            return Err(ShamirError::InvalidShare(format!(
                "shard {} belongs to a different split",
                shard.index
            )));
        }
        if shard.index == 0 || shard.index > self.total {
            return Err(ShamirError::InvalidShare(format!(
                "index {} outside 1..={}",
                shard.index, self.total
            )));
        }
        if shard.value.len() != self.secret_len {
            return Err(ShamirError::InvalidShare(format!(
                "shard {} has length {}, expected {}",
                shard.index,
                shard.value.len(),
                self.secret_len
            )));
        }
        let expected = self
            .shard_digests
            .get(shard.index as usize - 1)
            .ok_or_else(|| ShamirError::InvalidShare(format!("no checksum for shard {}", shard.index)))?;
        if &shard_digest(&self.split_id, shard.index, &shard.value) != expected {
            return Err(ShamirError::InvalidShare(format!(
                "shard {} failed checksum",
                shard.index
            )));
        }
        Ok(())
    }

    /// Whether `secret` is the value this handle was created for.
    pub fn matches_secret(&self, secret: &[u8]) -> bool {
        secret.len() == self.secret_len && secret_digest(&self.split_id, secret) == self.secret_digest
    }
}

pub(crate) fn shard_digest(split_id: &str, index: u8, value: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SHARD_TAG);
    hasher.update(split_id.as_bytes());
    hasher.update([index]);
    hasher.update(value);
    hex::encode(hasher.finalize())
}

pub(crate) fn secret_digest(split_id: &str, secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SECRET_TAG);
    hasher.update(split_id.as_bytes());
    hasher.update(secret);
    hex::encode(hasher.finalize())
}
