//! Error types for the protocol layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors that can occur while encoding, decoding or interpreting frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed bytes, missing fields, wrong types.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame decoded fine but breaks a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No unary procedure with this name exists.
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),
}

/// Reason code carried by failed responses.
///
/// A response with code [`OK`] succeeded; anything else maps to one of
/// these. Unknown numeric codes decode as [`ErrorCode::Internal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ErrorCode {
    /// The request payload was malformed.
    InvalidArgument,
    /// The challenge or identity didn't check out.
    Unauthenticated,
    /// Unknown node or procedure.
    NotFound,
    /// A protocol invariant was violated, e.g. no session for the caller's
    /// connection or no stream attached. Not retried automatically.
    IllegalState,
    /// Anything else, including storage failures.
    Internal,
}

/// The success reason code.
pub const OK: u16 = 0;

impl ErrorCode {
    /// The numeric reason code.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::InvalidArgument => 400,
            Self::Unauthenticated => 401,
            Self::NotFound => 404,
            Self::IllegalState => 409,
            Self::Internal => 500,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            404 => Self::NotFound,
            409 => Self::IllegalState,
            _ => Self::Internal,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid argument",
            Self::Unauthenticated => "unauthenticated",
            Self::NotFound => "not found",
            Self::IllegalState => "illegal state",
            Self::Internal => "internal",
        };
        write!(f, "{name} ({})", self.as_u16())
    }
}
