//! Error types for challenge derivation.

use crate::Algorithm;

/// Errors that can occur while deriving or verifying an auth challenge.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The algorithm tag is known but has no implementation.
    #[error("algorithm {0} is not supported")]
    UnsupportedAlgorithm(Algorithm),

    /// The secret table has no entry for the algorithm.
    #[error("no shared secret configured for algorithm {0}")]
    MissingSecret(Algorithm),

    /// The secret can't be used as an AES key (must be 16, 24 or 32 bytes).
    #[error("invalid AES key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// A presented challenge or response doesn't match the derived one.
    #[error("{0} mismatch")]
    Mismatch(&'static str),

    /// The challenge timestamp is outside the accepted window.
    #[error("challenge timestamp is stale")]
    Stale,
}
