//! Error types for the agent.

use tether_auth::AuthError;
use tether_fsm::FsmError;
use tether_rpc::RpcError;
use tether_store::StoreError;

/// Errors produced by the agent and its protocol operations.
///
/// None of these stop the agent: a failed state action is logged and
/// retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A call failed in transit or the server rejected it.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Challenge derivation failed, or the server's response didn't verify.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// The provisioning record could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The provisioning record is not valid JSON.
    #[error("corrupt provisioning record: {0}")]
    Record(#[from] serde_json::Error),

    /// State machine setup or shutdown failed.
    #[error("state machine error: {0}")]
    Fsm(#[from] FsmError),

    /// SignIn was attempted before any identity was provisioned.
    #[error("no identity provisioned")]
    NotProvisioned,

    /// No push stream is attached right now.
    #[error("no push stream attached")]
    NoStream,
}
