//! Wire protocol for Tether.
//!
//! - **Frames** ([`Frame`]): the envelope for unary calls and the push
//!   stream.
//! - **Procedures** ([`Procedure`], [`StreamProcedure`]): the closed set of
//!   operations a server answers, with typed request/response bodies.
//! - **Codec** ([`Codec`], [`JsonCodec`]): how frames and bodies become
//!   bytes.
//! - **Errors** ([`ProtocolError`], [`ErrorCode`]).
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → RPC channel / server dispatch
//! ```

mod codec;
mod error;
mod messages;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{ErrorCode, OK, ProtocolError};
pub use messages::{
    ConfigRequest, ConfigResponse, Procedure, ReportRequest, ReportResponse, SignInRequest,
    SignInResponse, SignOutRequest, SignOutResponse, SignUpRequest, SignUpResponse,
};
pub use types::{
    ClientId, DeviceId, Frame, IDENTITY_KEY, Metadata, StreamMessage, StreamProcedure,
};
