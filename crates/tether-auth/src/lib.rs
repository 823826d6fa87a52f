//! Shared-secret challenge/response derivation for the Tether handshake.
//!
//! Both sides of a SignUp derive an encrypted, timestamp-salted value from
//! identities they both know plus a shared secret:
//!
//! - **Agent challenge**:
//!   `AES-CBC(MD5(device ‖ hex(secret)) as hex ‖ timestamp_ns)`
//! - **Server response**:
//!   `AES-CBC(MD5(session ‖ device ‖ hex(secret)) as hex ‖ timestamp_ns ‖ expiry)`
//!
//! The AES key is the secret itself, the IV its first block, and the
//! plaintext is PKCS#7 padded. The derivations are pure: same inputs, same
//! bytes.
//!
//! This proves possession of the shared secret and binds the request to a
//! device and a moment in time. It provides no forward secrecy, and a single
//! leaked secret authenticates every device that shares it. Deployments that
//! need more should provision per-device secrets in the [`SecretTable`].

mod error;
mod secret;

pub use error::AuthError;
pub use secret::{Algorithm, Secret, SecretTable};

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use subtle::ConstantTimeEq;
use tracing::trace;

/// AES block size, also the IV length.
pub const BLOCK_SIZE: usize = 16;

/// Derives and checks handshake challenges against a [`SecretTable`].
#[derive(Debug, Clone)]
pub struct AuthKeys {
    table: SecretTable,
}

impl AuthKeys {
    /// Creates a deriver over the given secrets.
    pub fn new(table: SecretTable) -> Self {
        Self { table }
    }

    /// The agent-side SignUp challenge for `device_id` at `timestamp_ns`.
    pub fn challenge(
        &self,
        algorithm: Algorithm,
        device_id: &str,
        timestamp_ns: u64,
    ) -> Result<Vec<u8>, AuthError> {
        let secret = self.aes_secret(algorithm)?;
        let digest = digest_hex(&[device_id.as_bytes()], secret);
        let plaintext = format!("{digest}{timestamp_ns}");
        trace!(%algorithm, device_id, timestamp_ns, "deriving agent challenge");
        encrypt(secret, plaintext.as_bytes())
    }

    /// The server-side SignUp response binding `session_id` to `device_id`,
    /// the agent's timestamp and the issued expiry.
    pub fn response(
        &self,
        algorithm: Algorithm,
        session_id: &str,
        device_id: &str,
        timestamp_ns: u64,
        expiry: u64,
    ) -> Result<Vec<u8>, AuthError> {
        let secret = self.aes_secret(algorithm)?;
        let digest = digest_hex(&[session_id.as_bytes(), device_id.as_bytes()], secret);
        let plaintext = format!("{digest}{timestamp_ns}{expiry}");
        trace!(%algorithm, session_id, device_id, "deriving server response");
        encrypt(secret, plaintext.as_bytes())
    }

    /// Checks a challenge presented by an agent.
    pub fn verify_challenge(
        &self,
        algorithm: Algorithm,
        device_id: &str,
        timestamp_ns: u64,
        presented: &[u8],
    ) -> Result<(), AuthError> {
        let expected = self.challenge(algorithm, device_id, timestamp_ns)?;
        if !same_bytes(&expected, presented) {
            return Err(AuthError::Mismatch("challenge"));
        }
        Ok(())
    }

    /// Checks a response returned by the server.
    pub fn verify_response(
        &self,
        algorithm: Algorithm,
        session_id: &str,
        device_id: &str,
        timestamp_ns: u64,
        expiry: u64,
        presented: &[u8],
    ) -> Result<(), AuthError> {
        let expected = self.response(algorithm, session_id, device_id, timestamp_ns, expiry)?;
        if !same_bytes(&expected, presented) {
            return Err(AuthError::Mismatch("response"));
        }
        Ok(())
    }

    fn aes_secret(&self, algorithm: Algorithm) -> Result<&[u8], AuthError> {
        if algorithm != Algorithm::Aes {
            return Err(AuthError::UnsupportedAlgorithm(algorithm));
        }
        let secret = self.table.secret(algorithm)?.as_bytes();
        if !matches!(secret.len(), 16 | 24 | 32) {
            return Err(AuthError::InvalidKeyLength(secret.len()));
        }
        Ok(secret)
    }
}

/// Constant-time equality; slices of different lengths never match.
fn same_bytes(expected: &[u8], presented: &[u8]) -> bool {
    expected.ct_eq(presented).into()
}

/// Lowercase hex MD5 of `parts ‖ hex(secret)`.
fn digest_hex(parts: &[&[u8]], secret: &[u8]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.update(hex::encode(secret).as_bytes());
    hex::encode(hasher.finalize())
}

/// AES-CBC with PKCS#7 padding; key size picked from the secret length.
fn encrypt(secret: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
    let iv = &secret[..BLOCK_SIZE];
    let invalid = |_| AuthError::InvalidKeyLength(secret.len());
    let ciphertext = match secret.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(secret, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(secret, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(secret, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => return Err(AuthError::InvalidKeyLength(n)),
    };
    Ok(ciphertext)
}
