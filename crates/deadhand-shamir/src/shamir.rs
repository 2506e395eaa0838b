//! Core Shamir's Secret Sharing implementation
//!
//! Split a secret into N shards where any T can reconstruct it. Both
//! functions are pure: nothing is stored, and intermediate polynomial
//! coefficients are wiped before returning.

use crate::gf256::{interpolate_at_zero, poly_eval};
use crate::handle::{secret_digest, shard_digest, SecretHandle};
use crate::ShamirError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A single shard of a secret: the point `(index, f(index))` for every byte.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Shard {
    /// Split this shard belongs to
    pub split_id: String,
    /// Shard index (1..=N, never 0)
    pub index: u8,
    /// Shard data (same length as original secret)
    pub value: Vec<u8>,
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("split_id", &self.split_id)
            .field("index", &self.index)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Split a secret into `total` shards, any `threshold` of which reconstruct it.
///
/// Returns the `SecretHandle` needed to validate a later reconstruction,
/// together with the shards in index order.
pub fn split(
    secret: &[u8],
    total: u8,
    threshold: u8,
) -> Result<(SecretHandle, Vec<Shard>), ShamirError> {
    if threshold == 0 {
        return Err(ShamirError::InvalidThreshold);
    }
    if threshold > total {
        return Err(ShamirError::ThresholdExceedsShares);
    }
    if secret.is_empty() {
        return Err(ShamirError::EmptySecret);
    }

    let mut rng = rand::thread_rng();
    let mut split_bytes = [0u8; 16];
    rng.fill_bytes(&mut split_bytes);
    let split_id = hex::encode(split_bytes);

    let mut shards: Vec<Shard> = (1..=total)
        .map(|index| Shard {
            split_id: split_id.clone(),
            index,
            value: Vec::with_capacity(secret.len()),
        })
        .collect();

    // p(x) = secret_byte + c1*x + ... + c_{t-1}*x^{t-1}
    let mut coefficients = vec![0u8; threshold as usize];
    for &secret_byte in secret {
        coefficients[0] = secret_byte;
        rng.fill_bytes(&mut coefficients[1..]);

        for shard in &mut shards {
            shard.value.push(poly_eval(&coefficients, shard.index));
        }
    }
    coefficients.zeroize();

    let handle = SecretHandle {
        split_id: split_id.clone(),
        total,
        threshold,
        secret_len: secret.len(),
        secret_digest: secret_digest(&split_id, secret),
        shard_digests: shards
            .iter()
            .map(|s| shard_digest(&split_id, s.index, &s.value))
            .collect(),
    };

    Ok((handle, shards))
}

/// Reconstruct a secret from any `threshold` or more valid shards.
///
/// Duplicate submissions of the same shard count once. Every shard is
/// checked against the handle before interpolation, and the result is
/// checked against the handle's secret digest after.
pub fn reconstruct(handle: &SecretHandle, shards: &[Shard]) -> Result<Vec<u8>, ShamirError> {
    let mut distinct: BTreeMap<u8, &Shard> = BTreeMap::new();
    for shard in shards {
        if let Some(existing) = distinct.get(&shard.index) {
            if existing.value != shard.value {
                return Err(ShamirError::InvalidShare(format!(
                    "index {} submitted with conflicting values",
                    shard.index
                )));
            }
            continue;
        }
        handle.check_shard(shard)?;
        distinct.insert(shard.index, shard);
    }

    let need = handle.threshold as usize;
    if distinct.len() < need {
        return Err(ShamirError::InsufficientShares {
            have: distinct.len(),
            need,
        });
    }

    let mut points: Vec<(u8, u8)> = vec![(0, 0); distinct.len()];
    let mut secret = Vec::with_capacity(handle.secret_len);
    for byte_idx in 0..handle.secret_len {
        for (point, shard) in points.iter_mut().zip(distinct.values()) {
            *point = (shard.index, shard.value[byte_idx]);
        }
        match interpolate_at_zero(&points) {
            Some(byte) => secret.push(byte),
            None => {
                points.zeroize();
                secret.zeroize();
                return Err(ShamirError::InvalidShare("duplicate share indices".into()));
            }
        }
    }
    points.zeroize();

    if !handle.matches_secret(&secret) {
        secret.zeroize();
        return Err(ShamirError::InvalidShare(
            "shards are mutually inconsistent".into(),
        ));
    }

    Ok(secret)
}
