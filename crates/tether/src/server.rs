//! `Server` builder and server loop.
//!
//! This is the entry point for running a Tether server. It ties together
//! all the layers: transport → protocol → session → node store.

use std::sync::Arc;

use tether_auth::{AuthKeys, SecretTable};
use tether_protocol::ClientId;
use tether_store::{MemoryStore, TableStore};
use tether_transport::{Transport, TransportError, WebSocketTransport};
use tokio::sync::watch;

use crate::handler::handle_connection;
use crate::protocol::ServerProtocol;
use crate::{NoopHooks, Node, ServerConfig, ServerError, ServerHooks, TetherError};

/// Builder for configuring and starting a server.
///
/// # Example
///
/// ```rust,no_run
/// use tether::prelude::*;
///
/// # async fn demo() -> Result<(), TetherError> {
/// let secrets = SecretTable::new().with_secret(Algorithm::Aes, *b"0123456789abcdef");
/// let server = Server::builder()
///     .bind("0.0.0.0:8080")
///     .secrets(secrets)
///     .build()
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct ServerBuilder<H = NoopHooks> {
    config: ServerConfig,
    secrets: SecretTable,
    hooks: H,
}

impl ServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            secrets: SecretTable::new(),
            hooks: NoopHooks,
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ServerHooks> ServerBuilder<H> {
    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the shared secrets used to check SignUp challenges.
    pub fn secrets(mut self, secrets: SecretTable) -> Self {
        self.secrets = secrets;
        self
    }

    /// Sets the node lifecycle hooks.
    pub fn hooks<H2: ServerHooks>(self, hooks: H2) -> ServerBuilder<H2> {
        ServerBuilder {
            config: self.config,
            secrets: self.secrets,
            hooks,
        }
    }

    /// Binds a WebSocket listener and keeps node records in memory.
    pub async fn build(self) -> Result<Server<WebSocketTransport, MemoryStore, H>, TetherError> {
        let transport = WebSocketTransport::bind(&self.config.bind_addr).await?;
        Ok(self.build_with(transport, Arc::new(MemoryStore::new())))
    }

    /// Builds the server over the given transport and node store.
    pub fn build_with<T, S>(self, transport: T, store: Arc<S>) -> Server<T, S, H>
    where
        T: Transport,
        S: TableStore,
    {
        let protocol = Arc::new(ServerProtocol::new(
            store,
            AuthKeys::new(self.secrets),
            self.config,
            self.hooks,
        ));
        let (shutdown, _) = watch::channel(false);
        Server {
            transport,
            protocol,
            shutdown,
        }
    }
}

/// A Tether server.
///
/// Call [`run()`](Self::run) to start accepting connections. Grab a
/// [`ServerHandle`] first to push to nodes or stop the server from
/// elsewhere.
pub struct Server<T, S, H = NoopHooks> {
    transport: T,
    protocol: Arc<ServerProtocol<S, H>>,
    shutdown: watch::Sender<bool>,
}

impl Server<WebSocketTransport, MemoryStore> {
    /// Creates a new builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

impl<S: TableStore, H: ServerHooks> Server<WebSocketTransport, S, H> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }
}

impl<T, S, H> Server<T, S, H>
where
    T: Transport,
    S: TableStore,
    H: ServerHooks,
{
    /// A handle that stays usable after `run` takes the server.
    pub fn handle(&self) -> ServerHandle<S, H> {
        ServerHandle {
            protocol: Arc::clone(&self.protocol),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the server accept loop.
    ///
    /// Accepts incoming connections and spawns a handler task for each.
    /// Returns once [`ServerHandle::shutdown`] is called or the transport
    /// shuts down.
    pub async fn run(mut self) -> Result<(), TetherError> {
        tracing::info!("tether server running");
        let mut stop = self.shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = wait_stopped(&mut stop) => break,
                accepted = self.transport.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let protocol = Arc::clone(&self.protocol);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, protocol).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(TransportError::Shutdown) => break,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }

        if let Err(e) = self.transport.shutdown().await {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
        self.protocol.nodes().close().await?;
        tracing::info!("tether server stopped");
        Ok(())
    }
}

async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

/// Cheap, cloneable access to a server's nodes and sessions.
pub struct ServerHandle<S, H = NoopHooks> {
    protocol: Arc<ServerProtocol<S, H>>,
    shutdown: watch::Sender<bool>,
}

impl<S, H> Clone for ServerHandle<S, H> {
    fn clone(&self) -> Self {
        Self {
            protocol: Arc::clone(&self.protocol),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: TableStore, H: ServerHooks> ServerHandle<S, H> {
    /// Sends `payload` to the node bound to `identity` over its push stream.
    ///
    /// Fails with `NotFound` if no session is bound to `identity` and with
    /// `IllegalState` if the node hasn't attached a stream.
    pub fn push(&self, identity: &ClientId, payload: impl Into<Vec<u8>>) -> Result<(), ServerError> {
        self.protocol.push(identity, payload.into())
    }

    /// The node record for `identity`.
    pub async fn node(&self, identity: &ClientId) -> Result<Option<Node>, ServerError> {
        self.protocol.nodes().get(identity).await
    }

    /// Every node record.
    pub async fn nodes(&self) -> Result<Vec<Node>, ServerError> {
        self.protocol.nodes().list().await
    }

    /// Identities with a live, bound session.
    pub fn online(&self) -> Vec<ClientId> {
        self.protocol.sessions().identities()
    }

    /// The protocol state, for direct inspection.
    pub fn protocol(&self) -> &ServerProtocol<S, H> {
        &self.protocol
    }

    /// Stops the accept loop. Live connections keep running until their
    /// peers disconnect.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
