//! Node side of Tether: provisioning and the session lifecycle.
//!
//! - [`ProvisionStore`] keeps the node's [`Conf`] record (identity, expiry)
//!   in a [`TableStore`](tether_store::TableStore).
//! - [`AgentProtocol`] performs the SignUp/SignIn/SignOut/Report/Config
//!   calls and opens the push stream.
//! - [`Agent`] drives both from a tick-based state machine and reports
//!   progress through [`AgentHooks`].
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), tether_agent::AgentError> {
//! use std::sync::Arc;
//! use tether_agent::{Agent, AgentConfig, NoopHooks};
//! use tether_auth::{Algorithm, SecretTable};
//! use tether_store::MemoryStore;
//! use tether_transport::WebSocketDialer;
//!
//! let secrets = SecretTable::new().with_secret(Algorithm::Aes, *b"0123456789abcdef");
//! let agent = Agent::new(
//!     AgentConfig::new("dev-1"),
//!     WebSocketDialer::new("ws://127.0.0.1:8080"),
//!     Arc::new(MemoryStore::new()),
//!     secrets,
//!     NoopHooks,
//! )
//! .await?;
//! agent.start()?;
//! // ...
//! agent.stop().await?;
//! # Ok(())
//! # }
//! ```

mod agent;
mod conf;
mod config;
mod error;
mod hooks;
mod protocol;

pub use agent::{Agent, AgentState};
pub use conf::{CONF_KEY, CONF_TABLE, Conf, ProvisionStore};
pub use config::AgentConfig;
pub use error::AgentError;
pub use hooks::{AgentHooks, NoopHooks};
pub use protocol::AgentProtocol;
