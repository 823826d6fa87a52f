//! Error types for the session layer.

use tether_protocol::ClientId;
use tether_transport::ConnectionId;

/// Errors returned by the [`SessionManager`](crate::SessionManager).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session exists for this connection. Either the connection was
    /// never reported or it has already ended.
    #[error("no session for connection {0}")]
    NoSession(ConnectionId),

    /// No live session is bound to this identity.
    #[error("no session bound to {0}")]
    UnknownIdentity(ClientId),

    /// The identity's session has no push stream attached.
    #[error("no stream attached for {0}")]
    NoStream(ClientId),

    /// The attached push stream has gone away.
    #[error("stream closed for {0}")]
    StreamClosed(ClientId),
}
