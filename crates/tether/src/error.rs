//! Error types for the server and the unified Tether error.

use tether_agent::AgentError;
use tether_auth::AuthError;
use tether_fsm::FsmError;
use tether_protocol::{ClientId, ErrorCode, ProtocolError};
use tether_rpc::RpcError;
use tether_session::SessionError;
use tether_store::StoreError;
use tether_transport::TransportError;

/// Why a server-side handler refused a call.
///
/// Handlers never panic on bad input; every failure ends up here and is
/// sent back with the reason code from [`ServerError::code`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The request body didn't decode.
    #[error("malformed {procedure} request: {source}")]
    BadRequest {
        procedure: &'static str,
        #[source]
        source: ProtocolError,
    },

    /// The reply didn't encode.
    #[error("failed to encode {procedure} reply: {source}")]
    Encode {
        procedure: &'static str,
        #[source]
        source: ProtocolError,
    },

    /// No unary procedure by this name.
    #[error("unknown procedure {0}")]
    UnknownProcedure(String),

    /// No stream procedure with this tag.
    #[error("unknown stream procedure {0}")]
    UnknownStreamProcedure(u32),

    /// Session lookup or stream attachment failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The challenge didn't verify.
    #[error("challenge rejected: {0}")]
    Auth(#[from] AuthError),

    /// The call needs an identity in its metadata and had none.
    #[error("no identity in call metadata")]
    MissingIdentity,

    /// The caller's session hasn't completed SignUp or SignIn.
    #[error("session is not signed in")]
    NotSignedIn,

    /// No node record exists for this identity.
    #[error("unknown node {0}")]
    UnknownNode(ClientId),

    /// The node record belongs to another device.
    #[error("node {0} belongs to another device")]
    DeviceMismatch(ClientId),

    /// The identity's expiry has passed; the node must SignUp again.
    #[error("identity {0} has expired")]
    Expired(ClientId),

    /// Node records could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A node record is not valid JSON.
    #[error("corrupt node record: {0}")]
    Record(#[from] serde_json::Error),
}

impl ServerError {
    /// The wire reason code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest { .. } => ErrorCode::InvalidArgument,
            Self::UnknownProcedure(_) | Self::UnknownStreamProcedure(_) | Self::UnknownNode(_) => {
                ErrorCode::NotFound
            }
            Self::Session(SessionError::UnknownIdentity(_)) => ErrorCode::NotFound,
            Self::Session(_) => ErrorCode::IllegalState,
            Self::Auth(AuthError::MissingSecret(_) | AuthError::InvalidKeyLength(_)) => {
                ErrorCode::Internal
            }
            Self::Auth(_)
            | Self::MissingIdentity
            | Self::NotSignedIn
            | Self::DeviceMismatch(_)
            | Self::Expired(_) => ErrorCode::Unauthenticated,
            Self::Encode { .. } | Self::Store(_) | Self::Record(_) => ErrorCode::Internal,
        }
    }
}

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` conversions let `?` lift any sub-crate error into it.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

#[cfg(test)]
mod tests {
    use tether_transport::ConnectionId;

    use super::*;

    #[test]
    fn test_session_errors_map_to_illegal_state_or_not_found() {
        let no_session = ServerError::from(SessionError::NoSession(ConnectionId::new(1)));
        assert_eq!(no_session.code(), ErrorCode::IllegalState);

        let no_stream = ServerError::from(SessionError::NoStream(ClientId::new("a")));
        assert_eq!(no_stream.code(), ErrorCode::IllegalState);

        let unknown = ServerError::from(SessionError::UnknownIdentity(ClientId::new("a")));
        assert_eq!(unknown.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_auth_errors_split_between_client_and_server_fault() {
        assert_eq!(
            ServerError::from(AuthError::Mismatch("challenge")).code(),
            ErrorCode::Unauthenticated
        );
        assert_eq!(ServerError::from(AuthError::Stale).code(), ErrorCode::Unauthenticated);
        assert_eq!(
            ServerError::from(AuthError::InvalidKeyLength(3)).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_unknown_node_is_not_found() {
        assert_eq!(
            ServerError::UnknownNode(ClientId::new("x")).code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_from_transport_error() {
        let err: TetherError = TransportError::ConnectionClosed("gone".into()).into();
        assert!(matches!(err, TetherError::Transport(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_server_error() {
        let err: TetherError = ServerError::MissingIdentity.into();
        assert!(matches!(err, TetherError::Server(_)));
    }
}
