//! Server configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Seven days, the default identity lifetime.
pub const DEFAULT_IDENTITY_LIFETIME_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,

    /// How long an identity minted by SignUp stays valid, in seconds.
    pub identity_lifetime_secs: u64,

    /// How far a SignUp challenge timestamp may be from the server clock,
    /// in seconds. Zero disables the check.
    pub skew_window_secs: u64,

    /// Version of the node configuration served by the Config procedure.
    pub config_version: u64,

    /// Node configuration served by the Config procedure.
    pub settings: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            identity_lifetime_secs: DEFAULT_IDENTITY_LIFETIME_SECS,
            skew_window_secs: 300,
            config_version: 1,
            settings: BTreeMap::new(),
        }
    }
}
