use std::time::Duration;

use tether_protocol::{ErrorCode, ProtocolError};
use tether_transport::TransportError;

/// Errors returned by the client [`Channel`](crate::Channel).
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The underlying connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame or body could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No connection is up right now; the channel is redialing.
    #[error("not connected")]
    NotConnected,

    /// No response arrived within the caller's timeout.
    #[error("{procedure} timed out after {after:?}")]
    Timeout { procedure: String, after: Duration },

    /// The connection dropped while the call or stream was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The server answered with a nonzero reason code.
    #[error("server returned {code}: {message}")]
    Status { code: ErrorCode, message: String },

    /// The channel was closed with [`Channel::close`](crate::Channel::close).
    #[error("channel closed")]
    Closed,
}

impl RpcError {
    /// The server's reason code, if this is a [`RpcError::Status`].
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}
