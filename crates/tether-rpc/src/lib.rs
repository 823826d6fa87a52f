//! Client side of the Tether RPC substrate.
//!
//! A [`Channel`] owns one logical link to a server over any
//! [`Dialer`](tether_transport::Dialer):
//!
//! - **Unary calls**: [`Channel::call`] sends a request and waits for the
//!   matching response or the caller's timeout.
//! - **Metadata**: a per-channel string map piggybacked on every request;
//!   the session identity travels here once it is known.
//! - **Push stream**: [`Channel::open_stream`] returns a duplex
//!   ([`StreamSender`], [`StreamReceiver`]) pair.
//! - **Lifecycle events**: when the link drops, the channel fails pending
//!   calls, breaks the stream, emits [`ConnectionEvent::Closed`] and redials
//!   with a fixed backoff, emitting [`ConnectionEvent::Established`] when
//!   it is back.

mod channel;
mod error;
mod stream;

pub use channel::{Channel, ChannelConfig, ConnectionEvent};
pub use error::RpcError;
pub use stream::{StreamReceiver, StreamSender};
