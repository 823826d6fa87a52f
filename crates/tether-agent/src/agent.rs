//! The agent: a node's lifecycle state machine wired to the protocol.
//!
//! ```text
//!            ┌──────────── Established while servicing ───────────┐
//!            │              or push stream broke                  │
//!            ▼                                                    │
//! Restarting ──→ Authenticating ──→ Maintaining ──→ Servicing ────┘
//!                   │  ▲
//!                   └──┘ failed: retried next tick
//!
//! stop() ──→ Stopping (SignOut) ──→ channel closed
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tether_auth::{AuthKeys, SecretTable};
use tether_fsm::{BoxError, State, StateMachine};
use tether_protocol::{ClientId, ErrorCode, ReportRequest, StreamMessage, StreamProcedure};
use tether_rpc::{Channel, ConnectionEvent, StreamReceiver, StreamSender};
use tether_store::TableStore;
use tether_transport::Dialer;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::conf::unix_secs;
use crate::{AgentConfig, AgentError, AgentHooks, AgentProtocol, Conf, NoopHooks, ProvisionStore};

/// The agent's lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    /// SignUp if needed, then SignIn.
    Authenticating,
    /// Fetch configuration and attach the push stream.
    Maintaining,
    /// Steady state: periodic reports, push messages via the hooks.
    Servicing,
    /// Recovery after an unexpected reconnect or a broken stream.
    Restarting,
    /// SignOut before the machine stops.
    Stopping,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authenticating => "authenticating",
            Self::Maintaining => "maintaining",
            Self::Servicing => "servicing",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct Watcher<C> {
    sender: StreamSender<C>,
    task: JoinHandle<()>,
}

struct Inner<D: Dialer, S, H> {
    config: AgentConfig,
    conf: ProvisionStore<S>,
    protocol: AgentProtocol<D>,
    hooks: H,
    watcher: Mutex<Option<Watcher<D::Connection>>>,
    events: Mutex<Option<JoinHandle<()>>>,
    config_version: AtomicU64,
    started_at: Instant,
}

/// A node process's controller.
///
/// Created once per process. [`start`](Self::start) runs the lifecycle in
/// the background; [`stop`](Self::stop) signs out and closes the
/// connection.
pub struct Agent<D: Dialer, S: TableStore, H: AgentHooks = NoopHooks> {
    inner: Arc<Inner<D, S, H>>,
    fsm: StateMachine<AgentState>,
}

impl<D: Dialer, S: TableStore, H: AgentHooks> Agent<D, S, H> {
    /// Connects to the server, loads the provisioning record and builds the
    /// lifecycle machine. Nothing runs until [`start`](Self::start).
    pub async fn new(
        config: AgentConfig,
        dialer: D,
        store: Arc<S>,
        secrets: SecretTable,
        hooks: H,
    ) -> Result<Self, AgentError> {
        let channel = Channel::connect(dialer, config.channel_config()).await?;
        let protocol = AgentProtocol::new(channel, AuthKeys::new(secrets), config.call_timeout());
        let conf = ProvisionStore::open(store).await?;

        let fsm = StateMachine::new(config.machine_config());
        let inner = Arc::new(Inner {
            config,
            conf,
            protocol,
            hooks,
            watcher: Mutex::new(None),
            events: Mutex::new(None),
            config_version: AtomicU64::new(0),
            started_at: Instant::now(),
        });
        register_states(&fsm, &inner)?;
        Ok(Self { inner, fsm })
    }

    /// Fires the init hook and starts the lifecycle in `Authenticating`.
    pub fn start(&self) -> Result<(), AgentError> {
        self.inner.hooks.on_init(&self.inner.conf.conf());

        let events = self.inner.protocol.channel().subscribe();
        let task = tokio::spawn(watch_connection(events, self.fsm.clone()));
        if let Some(previous) = self.inner.events.lock().replace(task) {
            previous.abort();
        }

        if let Err(e) = self.fsm.startup() {
            if let Some(task) = self.inner.events.lock().take() {
                task.abort();
            }
            return Err(e.into());
        }
        info!(device = %self.inner.config.device_id, "agent started");
        Ok(())
    }

    /// Signs out, stops the lifecycle and closes the connection.
    ///
    /// The connection is torn down only after the state machine has fully
    /// stopped, so SignOut still has a link to go over.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let result = self.fsm.shutdown().await;

        if let Some(task) = self.inner.events.lock().take() {
            task.abort();
        }
        self.inner.detach_watcher();
        self.inner.protocol.close().await;
        self.inner.hooks.on_stop();
        info!(device = %self.inner.config.device_id, "agent stopped");
        result.map_err(AgentError::from)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> Option<AgentState> {
        self.fsm.current_state()
    }

    /// The lifecycle machine, for pausing or tracing.
    pub fn machine(&self) -> &StateMachine<AgentState> {
        &self.fsm
    }

    /// The provisioned identity; empty before the first SignUp.
    pub fn identity(&self) -> ClientId {
        self.inner.conf.identity()
    }

    /// A copy of the provisioning record.
    pub fn conf(&self) -> Conf {
        self.inner.conf.conf()
    }

    /// The provisioning store, e.g. for a factory reset.
    pub fn provision_store(&self) -> &ProvisionStore<S> {
        &self.inner.conf
    }

    /// Delivers a connection lifecycle notification.
    ///
    /// The agent already follows its own channel's events once started.
    /// This is for links whose reconnects surface elsewhere, e.g. a
    /// transport-level re-pairing.
    pub fn on_connection_event(&self, event: ConnectionEvent) {
        connection_event(&self.fsm, event);
    }

    /// Sends an application message to the server over the push stream.
    pub async fn send_message(&self, payload: Vec<u8>) -> Result<(), AgentError> {
        let sender = self
            .inner
            .watcher
            .lock()
            .as_ref()
            .map(|w| w.sender.clone())
            .ok_or(AgentError::NoStream)?;
        sender
            .send(StreamMessage::new(StreamProcedure::Message, payload))
            .await?;
        Ok(())
    }
}

fn register_states<D, S, H>(
    fsm: &StateMachine<AgentState>,
    inner: &Arc<Inner<D, S, H>>,
) -> Result<(), AgentError>
where
    D: Dialer,
    S: TableStore,
    H: AgentHooks,
{
    let auth = Arc::clone(inner);
    let maintain = Arc::clone(inner);
    let service = Arc::clone(inner);
    let restart = Arc::clone(inner);
    let stop = Arc::clone(inner);

    fsm.register_states(
        vec![
            State::new(AgentState::Authenticating, move |ctx| {
                let inner = Arc::clone(&auth);
                async move {
                    inner.authenticate().await.map_err(BoxError::from)?;
                    ctx.machine.move_to_state(AgentState::Maintaining);
                    Ok::<(), BoxError>(())
                }
            }),
            State::new(AgentState::Maintaining, move |ctx| {
                let inner = Arc::clone(&maintain);
                async move {
                    inner.maintain(&ctx.machine).await;
                    ctx.machine.move_to_state(AgentState::Servicing);
                    Ok::<(), BoxError>(())
                }
            }),
            State::new(AgentState::Servicing, move |_| {
                let inner = Arc::clone(&service);
                async move {
                    if let Err(e) = inner.report().await {
                        warn!(error = %e, "report failed");
                    }
                    Ok::<(), BoxError>(())
                }
            })
            .with_ticks(inner.config.report_every_ticks),
            State::new(AgentState::Restarting, move |ctx| {
                let inner = Arc::clone(&restart);
                async move {
                    inner.detach_watcher();
                    ctx.machine.move_to_state(AgentState::Authenticating);
                    Ok::<(), BoxError>(())
                }
            }),
            State::new(AgentState::Stopping, move |_| {
                let inner = Arc::clone(&stop);
                async move {
                    if let Err(e) = inner.protocol.sign_out("agent stopping").await {
                        warn!(error = %e, "sign-out failed");
                    }
                    Ok::<(), BoxError>(())
                }
            }),
        ],
        AgentState::Authenticating,
        Some(AgentState::Stopping),
    )?;
    Ok(())
}

impl<D: Dialer, S: TableStore, H: AgentHooks> Inner<D, S, H> {
    /// SignUp when the record needs it, then SignIn.
    async fn authenticate(&self) -> Result<(), AgentError> {
        let device = &self.config.device_id;
        if self.conf.needs_provisioning(unix_secs()) {
            let reply = self.protocol.sign_up(device, self.config.algorithm).await?;
            self.conf
                .update_identity(reply.identity, reply.expire_time)
                .await?;
        }

        let identity = self.conf.identity();
        match self
            .protocol
            .sign_in(&identity, device, &self.config.endpoint)
            .await
        {
            Ok(reply) => {
                self.hooks.on_authenticated(&reply.identity);
                Ok(())
            }
            Err(AgentError::Rpc(e)) if e.code() == Some(ErrorCode::NotFound) => {
                // The server has no record of this identity: provision again.
                warn!(%identity, "server does not know this identity, resetting");
                self.conf.reset().await?;
                Err(AgentError::Rpc(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort configuration fetch plus push stream attach.
    async fn maintain(self: &Arc<Self>, machine: &StateMachine<AgentState>) {
        let version = self.config_version.load(Ordering::Relaxed);
        match self.protocol.config(version).await {
            Ok(config) => {
                self.config_version.store(config.version, Ordering::Relaxed);
                self.hooks.on_maintained(&config);
            }
            Err(e) => warn!(error = %e, "configuration fetch failed"),
        }

        self.detach_watcher();
        match self.protocol.watch().await {
            Ok((sender, receiver)) => {
                let task = tokio::spawn(watch_stream(
                    receiver,
                    Arc::clone(self),
                    machine.clone(),
                ));
                *self.watcher.lock() = Some(Watcher { sender, task });
            }
            Err(e) => warn!(error = %e, "push stream attach failed"),
        }
    }

    async fn report(&self) -> Result<(), AgentError> {
        let mut status = BTreeMap::new();
        status.insert("device".to_string(), self.config.device_id.to_string());
        status.insert(
            "config_version".to_string(),
            self.config_version.load(Ordering::Relaxed).to_string(),
        );
        let request = ReportRequest {
            endpoint: self.config.endpoint.clone(),
            uptime: self.started_at.elapsed().as_secs(),
            status,
        };
        self.protocol.report(&request).await?;
        Ok(())
    }

    fn detach_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.task.abort();
        }
    }
}

/// Forwards push messages to the hooks until the stream ends.
///
/// A clean end just stops forwarding. A broken stream means the session is
/// gone, so the lifecycle restarts.
async fn watch_stream<D, S, H>(
    mut receiver: StreamReceiver,
    inner: Arc<Inner<D, S, H>>,
    machine: StateMachine<AgentState>,
) where
    D: Dialer,
    S: TableStore,
    H: AgentHooks,
{
    loop {
        match receiver.recv().await {
            Ok(Some(message)) => inner.hooks.on_message(message),
            Ok(None) => {
                debug!("push stream ended");
                return;
            }
            Err(e) => {
                let restarted = machine.move_from(AgentState::Maintaining, AgentState::Restarting)
                    || machine.move_from(AgentState::Servicing, AgentState::Restarting);
                if restarted {
                    warn!(error = %e, "push stream broke, restarting");
                } else {
                    debug!(error = %e, "push stream broke");
                }
                return;
            }
        }
    }
}

/// Feeds the channel's lifecycle events to [`connection_event`].
async fn watch_connection(
    mut events: broadcast::Receiver<ConnectionEvent>,
    machine: StateMachine<AgentState>,
) {
    loop {
        match events.recv().await {
            Ok(event) => connection_event(&machine, event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "connection events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Turns an unexpected reconnect while servicing into a restart.
fn connection_event(machine: &StateMachine<AgentState>, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Established(conn) => {
            if machine.move_from(AgentState::Servicing, AgentState::Restarting) {
                info!(%conn, "reconnected while servicing, restarting");
            } else {
                debug!(%conn, "connection established");
            }
        }
        ConnectionEvent::Closed(conn) => debug!(%conn, "connection closed"),
    }
}
