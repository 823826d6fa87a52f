//! Server-side procedure handlers.
//!
//! A closed dispatch table: the procedure name parses into a [`Procedure`]
//! and each variant has one typed handler. Stream messages dispatch the
//! same way on their [`StreamProcedure`] tag.
//!
//! # Node writes
//!
//! Node records live in an external store, so a read-modify-write of one
//! record is not atomic on its own. Every handler that changes a record
//! holds `writes` across the whole cycle. The lock also serializes
//! SignUp, which is what makes two concurrent SignUps on one connection
//! resolve to the same identity.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_auth::{AuthError, AuthKeys};
use tether_protocol::{
    ClientId, Codec, ConfigRequest, ConfigResponse, IDENTITY_KEY, JsonCodec, Metadata, Procedure,
    ReportRequest, ReportResponse, SignInRequest, SignInResponse, SignOutRequest,
    SignOutResponse, SignUpRequest, SignUpResponse, StreamMessage, StreamProcedure,
};
use tether_session::{Session, SessionError, SessionManager, StreamHandle, generate_identity};
use tether_store::TableStore;
use tether_transport::ConnectionId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Node, NodeStatus, NodeStore, ServerConfig, ServerError, ServerHooks};

/// Who is calling: the connection a request arrived on and the metadata
/// it carried.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub conn: ConnectionId,
    pub metadata: Metadata,
}

impl CallContext {
    pub fn new(conn: ConnectionId, metadata: Metadata) -> Self {
        Self { conn, metadata }
    }
}

/// The server's procedure handlers and the state they share.
pub struct ServerProtocol<S, H> {
    sessions: SessionManager,
    nodes: NodeStore<S>,
    keys: AuthKeys,
    config: ServerConfig,
    hooks: H,
    codec: JsonCodec,
    writes: Mutex<()>,
}

impl<S: TableStore, H: ServerHooks> ServerProtocol<S, H> {
    pub fn new(store: Arc<S>, keys: AuthKeys, config: ServerConfig, hooks: H) -> Self {
        Self {
            sessions: SessionManager::new(),
            nodes: NodeStore::new(store),
            keys,
            config,
            hooks,
            codec: JsonCodec,
            writes: Mutex::new(()),
        }
    }

    /// Live sessions.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Persistent node records.
    pub fn nodes(&self) -> &NodeStore<S> {
        &self.nodes
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    /// A transport connection came up.
    pub fn connection_begin(&self, key: ConnectionId) {
        self.sessions.save(key);
    }

    /// A transport connection went away.
    ///
    /// Drops the session. If it was still bound, its node goes offline and
    /// the leave hook fires.
    pub async fn connection_end(&self, key: ConnectionId) -> Result<(), ServerError> {
        let Some(session) = self.sessions.delete(key) else {
            return Ok(());
        };
        if !session.is_bound() {
            return Ok(());
        }
        let _writes = self.writes.lock().await;
        if self.sessions.get_by_id(&session.identity).is_some() {
            // Already signed in again on another connection.
            return Ok(());
        }
        self.mark_offline(&session.identity).await
    }

    // ---------------------------------------------------------------------
    // Unary dispatch
    // ---------------------------------------------------------------------

    /// Runs the handler for `procedure` and returns its encoded reply.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        procedure: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, ServerError> {
        let procedure: Procedure = procedure
            .parse()
            .map_err(|_| ServerError::UnknownProcedure(procedure.to_string()))?;
        debug!(conn = %ctx.conn, %procedure, "dispatching");
        match procedure {
            Procedure::SignUp => {
                let reply = self.sign_up(ctx, self.decode(procedure, payload)?).await?;
                self.encode(procedure, &reply)
            }
            Procedure::SignIn => {
                let reply = self.sign_in(ctx, self.decode(procedure, payload)?).await?;
                self.encode(procedure, &reply)
            }
            Procedure::SignOut => {
                let reply = self.sign_out(ctx, self.decode(procedure, payload)?).await?;
                self.encode(procedure, &reply)
            }
            Procedure::Report => {
                let reply = self.report(ctx, self.decode(procedure, payload)?).await?;
                self.encode(procedure, &reply)
            }
            Procedure::Config => {
                let reply = self.node_config(ctx, self.decode(procedure, payload)?)?;
                self.encode(procedure, &reply)
            }
        }
    }

    /// Verifies the agent's challenge and binds an identity to the caller.
    ///
    /// A session that is already bound keeps its identity and expiry while
    /// that identity is valid. Once it has expired, the old node goes
    /// offline and the session is rebound to a freshly minted identity.
    pub async fn sign_up(
        &self,
        ctx: &CallContext,
        request: SignUpRequest,
    ) -> Result<SignUpResponse, ServerError> {
        let _writes = self.writes.lock().await;
        let session = self.session(ctx.conn)?;
        self.check_skew(request.timestamp)?;
        self.keys.verify_challenge(
            request.algorithm,
            request.device_id.as_str(),
            request.timestamp,
            &request.challenge,
        )?;

        let now = unix_secs();
        let expire = now + self.config.identity_lifetime_secs;
        let mut rebind = false;
        let node = if session.is_bound() {
            match self.nodes.get(&session.identity).await? {
                Some(node) if node.device_id != request.device_id => {
                    return Err(ServerError::DeviceMismatch(session.identity));
                }
                Some(node) if node.expire_time > now => {
                    debug!(identity = %node.identity, "duplicate sign-up, identity reused");
                    node
                }
                Some(expired) => {
                    info!(identity = %expired.identity, "bound identity expired, minting a new one");
                    self.mark_offline(&expired.identity).await?;
                    rebind = true;
                    Node::new(generate_identity(), request.device_id.clone(), expire, now)
                }
                None => Node::new(session.identity.clone(), request.device_id.clone(), expire, now),
            }
        } else {
            Node::new(generate_identity(), request.device_id.clone(), expire, now)
        };
        self.nodes.put(&node).await?;
        let identity = if rebind {
            self.sessions.rebind(ctx.conn, node.identity.clone())?
        } else {
            self.sessions.bind(ctx.conn, node.identity.clone())?
        };

        let response = self.keys.response(
            request.algorithm,
            identity.as_str(),
            request.device_id.as_str(),
            request.timestamp,
            node.expire_time,
        )?;
        info!(conn = %ctx.conn, device = %request.device_id, %identity, "node signed up");
        Ok(SignUpResponse {
            identity,
            expire_time: node.expire_time,
            response,
        })
    }

    /// Marks the caller's node online.
    ///
    /// The identity comes from the session if it is bound, else from the
    /// call metadata. Repeating SignIn on a live, bound session changes
    /// nothing.
    pub async fn sign_in(
        &self,
        ctx: &CallContext,
        request: SignInRequest,
    ) -> Result<SignInResponse, ServerError> {
        let _writes = self.writes.lock().await;
        let session = self.session(ctx.conn)?;
        let identity = if session.is_bound() {
            session.identity.clone()
        } else {
            ctx.metadata
                .get(IDENTITY_KEY)
                .filter(|id| !id.is_empty())
                .map(|id| ClientId::new(id.as_str()))
                .ok_or(ServerError::MissingIdentity)?
        };

        let mut node = self
            .nodes
            .get(&identity)
            .await?
            .ok_or_else(|| ServerError::UnknownNode(identity.clone()))?;
        if node.device_id != request.device_id {
            return Err(ServerError::DeviceMismatch(identity));
        }
        let now = unix_secs();
        if node.expire_time <= now {
            return Err(ServerError::Expired(identity));
        }

        if session.is_bound() && node.is_online() {
            debug!(%identity, "duplicate sign-in");
            return Ok(SignInResponse {
                identity,
                expire_time: node.expire_time,
                server_time: now,
            });
        }

        node.status = NodeStatus::Online;
        node.sign_in_time = now;
        node.update_time = now;
        if !request.endpoint.is_empty() {
            node.endpoint = request.endpoint;
        }
        self.nodes.put(&node).await?;
        self.sessions.bind(ctx.conn, identity.clone())?;
        info!(conn = %ctx.conn, %identity, "node joined");
        self.hooks.on_node_join(&node);

        Ok(SignInResponse {
            identity,
            expire_time: node.expire_time,
            server_time: now,
        })
    }

    /// Marks the caller's node offline. A caller with no session, or an
    /// unbound one, is already signed out.
    pub async fn sign_out(
        &self,
        ctx: &CallContext,
        request: SignOutRequest,
    ) -> Result<SignOutResponse, ServerError> {
        let Some(session) = self.sessions.get_by_key(ctx.conn) else {
            debug!(conn = %ctx.conn, "sign-out without a session");
            return Ok(SignOutResponse {});
        };
        if !session.is_bound() {
            return Ok(SignOutResponse {});
        }
        let _writes = self.writes.lock().await;
        info!(identity = %session.identity, reason = %request.reason, "node signing out");
        self.mark_offline(&session.identity).await?;
        Ok(SignOutResponse {})
    }

    /// Records a liveness report from a signed-in node.
    pub async fn report(
        &self,
        ctx: &CallContext,
        request: ReportRequest,
    ) -> Result<ReportResponse, ServerError> {
        let _writes = self.writes.lock().await;
        let identity = self.bound(ctx.conn)?.identity;
        let mut node = self
            .nodes
            .get(&identity)
            .await?
            .ok_or_else(|| ServerError::UnknownNode(identity.clone()))?;
        let now = unix_secs();
        node.update_time = now;
        if !request.endpoint.is_empty() {
            node.endpoint = request.endpoint;
        }
        self.nodes.put(&node).await?;
        debug!(%identity, uptime = request.uptime, status = ?request.status, "report received");
        Ok(ReportResponse { server_time: now })
    }

    /// Serves the configured node settings to a signed-in node.
    pub fn node_config(
        &self,
        ctx: &CallContext,
        request: ConfigRequest,
    ) -> Result<ConfigResponse, ServerError> {
        let identity = self.bound(ctx.conn)?.identity;
        if request.version != self.config.config_version {
            debug!(%identity, have = request.version, serving = self.config.config_version, "config out of date");
        }
        Ok(ConfigResponse {
            version: self.config.config_version,
            settings: self.config.settings.clone(),
        })
    }

    // ---------------------------------------------------------------------
    // Stream dispatch
    // ---------------------------------------------------------------------

    /// Handles one inbound stream message. Returns the reply to send back,
    /// if the handler produced one.
    ///
    /// `handle` is the outbound half of this connection's stream; `Initiate`
    /// attaches it to the session.
    pub fn handle_stream(
        &self,
        conn: ConnectionId,
        message: StreamMessage,
        handle: &StreamHandle,
    ) -> Result<Option<StreamMessage>, ServerError> {
        let procedure = StreamProcedure::from_tag(message.procedure)
            .ok_or(ServerError::UnknownStreamProcedure(message.procedure))?;
        match procedure {
            StreamProcedure::Initiate => {
                self.sessions.update_stream(conn, handle.clone())?;
                debug!(%conn, "stream initiated");
                Ok(None)
            }
            StreamProcedure::Message => {
                let identity = self.bound(conn)?.identity;
                Ok(self
                    .hooks
                    .on_message(&identity, message)
                    .map(|reply| StreamMessage::new(StreamProcedure::Message, reply)))
            }
        }
    }

    /// The stream on `conn` ended.
    pub fn stream_closed(&self, conn: ConnectionId) {
        self.sessions.clear_stream(conn);
    }

    /// Queues `payload` as a `Message` on the push stream of `identity`.
    pub fn push(&self, identity: &ClientId, payload: Vec<u8>) -> Result<(), ServerError> {
        self.sessions
            .push(identity, StreamMessage::new(StreamProcedure::Message, payload))?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn session(&self, conn: ConnectionId) -> Result<Session, ServerError> {
        self.sessions
            .get_by_key(conn)
            .ok_or(ServerError::Session(SessionError::NoSession(conn)))
    }

    fn bound(&self, conn: ConnectionId) -> Result<Session, ServerError> {
        let session = self.session(conn)?;
        if !session.is_bound() {
            return Err(ServerError::NotSignedIn);
        }
        Ok(session)
    }

    /// Caller must hold `writes`.
    async fn mark_offline(&self, identity: &ClientId) -> Result<(), ServerError> {
        let Some(mut node) = self.nodes.get(identity).await? else {
            warn!(%identity, "bound session without a node record");
            return Ok(());
        };
        if !node.is_online() {
            return Ok(());
        }
        node.status = NodeStatus::Offline;
        node.update_time = unix_secs();
        self.nodes.put(&node).await?;
        info!(%identity, "node left");
        self.hooks.on_node_leave(&node);
        Ok(())
    }

    fn check_skew(&self, timestamp_ns: u64) -> Result<(), ServerError> {
        let window = self.config.skew_window_secs;
        if window == 0 {
            return Ok(());
        }
        let now_ns = unix_nanos();
        if now_ns.abs_diff(timestamp_ns) > window.saturating_mul(1_000_000_000) {
            return Err(AuthError::Stale.into());
        }
        Ok(())
    }

    fn decode<T: DeserializeOwned>(
        &self,
        procedure: Procedure,
        payload: &[u8],
    ) -> Result<T, ServerError> {
        self.codec
            .decode(payload)
            .map_err(|source| ServerError::BadRequest {
                procedure: procedure.name(),
                source,
            })
    }

    fn encode<T: Serialize>(&self, procedure: Procedure, reply: &T) -> Result<Vec<u8>, ServerError> {
        self.codec
            .encode(reply)
            .map_err(|source| ServerError::Encode {
                procedure: procedure.name(),
                source,
            })
    }
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
