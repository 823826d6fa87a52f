//! Runs a Tether server and one agent over a local WebSocket.
//!
//! ```text
//! node-demo <config.json>
//! ```
//!
//! The config file must carry the shared secret, hex-encoded; every other
//! field has a default:
//!
//! ```json
//! { "secrets": { "aes": "<32, 48 or 64 hex digits>" } }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tether::prelude::*;
use tether::protocol_types::ConfigResponse;
use tether::transport::TransportError;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything the demo reads from its optional JSON config file.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoConfig {
    server: ServerConfig,
    agent: AgentConfig,
    secrets: SecretTable,
    state_file: PathBuf,
    push_every_secs: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1:8080".into(),
                ..Default::default()
            },
            agent: AgentConfig {
                endpoint: "127.0.0.1:9000".into(),
                report_every_ticks: 5,
                ..AgentConfig::new("demo-node")
            },
            secrets: SecretTable::new(),
            state_file: PathBuf::from("node-demo-state.json"),
            push_every_secs: 10,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<DemoConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Err("usage: node-demo <config.json>".into());
    };
    parse_config(&std::fs::read(path)?)
}

/// Parses the config file. Secrets never have a built-in default.
fn parse_config(bytes: &[u8]) -> Result<DemoConfig, Box<dyn std::error::Error>> {
    let config: DemoConfig = serde_json::from_slice(bytes)?;
    let algorithm = config.agent.algorithm;
    if let Err(e) = config.secrets.secret(algorithm) {
        return Err(format!("{e}: set `secrets.{algorithm}` in the config file").into());
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

struct LogServer;

impl ServerHooks for LogServer {
    fn on_node_join(&self, node: &Node) {
        tracing::info!(identity = %node.identity, device = %node.device_id, "node joined");
    }

    fn on_node_leave(&self, node: &Node) {
        tracing::info!(identity = %node.identity, "node left");
    }

    fn on_message(&self, identity: &ClientId, message: StreamMessage) -> Option<Vec<u8>> {
        let text = String::from_utf8_lossy(&message.payload);
        tracing::info!(%identity, %text, "message from node");
        Some(format!("got {} bytes", message.payload.len()).into_bytes())
    }
}

struct LogNode;

impl AgentHooks for LogNode {
    fn on_authenticated(&self, identity: &ClientId) {
        tracing::info!(%identity, "agent authenticated");
    }

    fn on_maintained(&self, config: &ConfigResponse) {
        tracing::info!(version = config.version, "agent configuration applied");
    }

    fn on_message(&self, message: StreamMessage) {
        let text = String::from_utf8_lossy(&message.payload);
        tracing::info!(%text, "push received");
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

async fn start_server(
    config: &DemoConfig,
) -> Result<(ServerHandle<MemoryStore, LogServer>, String), TetherError> {
    let server = ServerBuilder::new()
        .config(config.server.clone())
        .secrets(config.secrets.clone())
        .hooks(LogServer)
        .build()
        .await?;
    let addr = server.local_addr().map_err(TransportError::AcceptFailed)?;
    let url = format!("ws://{addr}");
    let handle = server.handle();
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "server stopped with error");
        }
    });
    Ok((handle, url))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(path.as_deref())?;

    let (server, url) = start_server(&config).await?;
    tracing::info!(%url, "server listening");

    let store = Arc::new(FileStore::open(&config.state_file).await?);
    let agent = Agent::new(
        config.agent.clone(),
        WebSocketDialer::new(url),
        store,
        config.secrets.clone(),
        LogNode,
    )
    .await?;
    agent.start()?;

    let pusher = {
        let server = server.clone();
        let period = Duration::from_secs(config.push_every_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut count = 0u64;
            loop {
                interval.tick().await;
                for identity in server.online() {
                    count += 1;
                    if let Err(e) = server.push(&identity, format!("hello #{count}")) {
                        tracing::debug!(%identity, error = %e, "push skipped");
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    pusher.abort();
    agent.stop().await?;
    server.shutdown();
    Ok(())
}
