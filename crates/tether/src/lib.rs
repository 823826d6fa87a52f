//! # Tether
//!
//! Node provisioning and session server.
//!
//! Nodes run a [`tether_agent::Agent`], which signs up once to obtain an
//! identity, signs in on every connection and then keeps a push stream
//! open. The [`Server`] here answers those calls: it checks SignUp
//! challenges against a shared [`SecretTable`], keeps a persistent
//! [`Node`] record per identity and tracks which connection each node is
//! live on, so it can [`push`](ServerHandle::push) messages to it.
//!
//! ```text
//! Agent ──Channel──▶ Transport ──▶ handler ──▶ ServerProtocol
//!                                               ├─ SessionManager (live)
//!                                               └─ NodeStore (persistent)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! # async fn demo() -> Result<(), TetherError> {
//! let secrets = SecretTable::new().with_secret(Algorithm::Aes, *b"0123456789abcdef");
//! let server = Server::builder().bind("0.0.0.0:8080").secrets(secrets).build().await?;
//! let handle = server.handle();
//! tokio::spawn(server.run());
//! for node in handle.nodes().await? {
//!     println!("{} is {}", node.identity, node.status);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`SecretTable`]: tether_auth::SecretTable

mod config;
mod error;
mod handler;
mod hooks;
mod node;
mod protocol;
mod server;

pub use config::{DEFAULT_IDENTITY_LIFETIME_SECS, ServerConfig};
pub use error::{ServerError, TetherError};
pub use hooks::{NoopHooks, ServerHooks};
pub use node::{NODE_TABLE, Node, NodeStatus, NodeStore};
pub use protocol::{CallContext, ServerProtocol};
pub use server::{Server, ServerBuilder, ServerHandle};

pub use tether_agent as agent;
pub use tether_auth as auth;
pub use tether_fsm as fsm;
pub use tether_protocol as protocol_types;
pub use tether_rpc as rpc;
pub use tether_session as session;
pub use tether_store as store;
pub use tether_transport as transport;

/// Everything needed to run a server or an agent.
pub mod prelude {
    pub use crate::{
        Node, NodeStatus, Server, ServerBuilder, ServerConfig, ServerError, ServerHandle,
        ServerHooks, TetherError,
    };
    pub use tether_agent::{Agent, AgentConfig, AgentError, AgentHooks, AgentState};
    pub use tether_auth::{Algorithm, SecretTable};
    pub use tether_protocol::{ClientId, DeviceId, StreamMessage};
    pub use tether_store::{FileStore, MemoryStore, TableStore};
    pub use tether_transport::{MemoryTransport, WebSocketDialer, WebSocketTransport};
}
