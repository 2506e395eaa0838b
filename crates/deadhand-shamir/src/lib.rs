//! Deadhand Shamir Module
//!
//! Split a secret into `n` shards so that any `t` of them reconstruct it and
//! fewer reveal nothing.
//!
//! Each byte of the secret is the constant term of its own random polynomial
//! of degree `t - 1` over GF(256). Shard `i` holds the evaluations at `x = i`.
//! Reconstruction is Lagrange interpolation at `x = 0`.
//!
//! # Example
//!
//! ```
//! use deadhand_shamir::{reconstruct, split};
//!
//! let secret = b"vault passphrase";
//!
//! // 2-of-3
//! let (handle, shards) = split(secret, 3, 2).unwrap();
//!
//! // Any two shards recover the secret
//! let recovered = reconstruct(&handle, &shards[1..]).unwrap();
//! assert_eq!(recovered.as_slice(), secret);
//! ```

pub mod gf256;
pub mod handle;
pub mod shamir;

// Re-exports
pub use handle::SecretHandle;
pub use shamir::{reconstruct, split, Shard};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShamirError {
    #[error("Invalid threshold: need at least 1")]
    InvalidThreshold,
    #[error("Threshold exceeds share count")]
    ThresholdExceedsShares,
    #[error("Cannot split an empty secret")]
    EmptySecret,
    #[error("Not enough shares to reconstruct: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },
    #[error("Invalid share: {0}")]
    InvalidShare(String),
}

/// Configuration for a Shamir split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShamirConfig {
    /// Minimum shares needed to reconstruct (t)
    pub threshold: u8,
    /// Total shares to generate (n)
    pub total_shares: u8,
}

impl ShamirConfig {
    /// Common 2-of-3 setup
    pub fn two_of_three() -> Self {
        Self {
            threshold: 2,
            total_shares: 3,
        }
    }

    /// Common 3-of-5 setup
    pub fn three_of_five() -> Self {
        Self {
            threshold: 3,
            total_shares: 5,
        }
    }

    /// `1 <= t <= n`. Both `t = 1` and `t = n` are valid.
    pub fn validate(&self) -> Result<(), ShamirError> {
        if self.threshold == 0 {
            return Err(ShamirError::InvalidThreshold);
        }
        if self.threshold > self.total_shares {
            return Err(ShamirError::ThresholdExceedsShares);
        }
        Ok(())
    }

    /// Split `secret` with this configuration.
    pub fn split(&self, secret: &[u8]) -> Result<(SecretHandle, Vec<Shard>), ShamirError> {
        split(secret, self.total_shares, self.threshold)
    }
}
