//! Server-side session tracking for Tether.
//!
//! A session correlates one live underlying connection with the node
//! identity that authenticated on it. Sessions are created in two phases:
//!
//! 1. **Phase I**: [`SessionManager::save`] when the transport reports a
//!    new connection. The session is keyed by its [`ConnectionId`] only.
//! 2. **Phase II**: [`SessionManager::bind`] once SignUp or SignIn has
//!    assigned or recovered a [`ClientId`]. The session is now also
//!    reachable by identity.
//!
//! [`SessionManager::delete`] on connection end removes both entries.
//!
//! ```text
//! Server protocol (above)  ← resolves callers, pushes to nodes
//!     ↕
//! Session layer (this crate)  ← connection key ⇄ node identity
//!     ↕
//! Transport (below)  ← provides ConnectionId
//! ```
//!
//! [`ConnectionId`]: tether_transport::ConnectionId
//! [`ClientId`]: tether_protocol::ClientId

mod error;
mod manager;
mod session;

pub use error::SessionError;
pub use manager::{SessionManager, generate_identity};
pub use session::{Session, StreamHandle};
