//! The shared-secret table, injected by configuration.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::AuthError;

/// Cipher selection for the challenge derivation.
///
/// Only [`Algorithm::Aes`] is implemented. The other tags exist so that
/// peers announcing them get a clear [`AuthError::UnsupportedAlgorithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Aes,
    Des,
    Sm4,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aes => "aes",
            Self::Des => "des",
            Self::Sm4 => "sm4",
        };
        f.write_str(name)
    }
}

/// Secret key material. Serialized as hex, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(#[serde(with = "hex")] Vec<u8>);

impl Secret {
    /// Wraps raw key bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<{} bytes>)", self.0.len())
    }
}

/// One shared secret per algorithm.
///
/// Both the agent and the server are handed the same table at startup;
/// rotating a secret means deploying a new table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretTable {
    secrets: HashMap<Algorithm, Secret>,
}

impl SecretTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the secret for `algorithm`.
    pub fn with_secret(mut self, algorithm: Algorithm, secret: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(algorithm, Secret::new(secret));
        self
    }

    /// Looks up the secret for `algorithm`.
    pub fn secret(&self, algorithm: Algorithm) -> Result<&Secret, AuthError> {
        self.secrets
            .get(&algorithm)
            .ok_or(AuthError::MissingSecret(algorithm))
    }
}
