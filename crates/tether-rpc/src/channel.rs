//! The client channel and its redial supervisor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_protocol::{Codec, ErrorCode, Frame, JsonCodec, Metadata, OK, Procedure, ProtocolError};
use tether_transport::{Connection, ConnectionId, Dialer};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::RpcError;
use crate::stream::{StreamReceiver, StreamSender, StreamSink};

/// Settings for a [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Delay between redial attempts after the link drops.
    pub redial_backoff: Duration,
    /// Buffer of the lifecycle event broadcast. Slow subscribers that fall
    /// further behind than this miss events.
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            redial_backoff: Duration::from_secs(1),
            event_capacity: 16,
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection came up (the first dial or a successful redial).
    Established(ConnectionId),
    /// A connection went away.
    Closed(ConnectionId),
}

struct Inner<D: Dialer> {
    dialer: D,
    config: ChannelConfig,
    codec: JsonCodec,
    next_id: AtomicU64,
    metadata: RwLock<Metadata>,
    link: RwLock<Option<Arc<D::Connection>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    stream: Mutex<Option<StreamSink>>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A client link to one server.
///
/// Cheap to clone. The background supervisor keeps redialing until
/// [`close`](Self::close) is called.
pub struct Channel<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for Channel<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> Channel<D> {
    /// Dials the server and starts the supervisor.
    ///
    /// Fails if the first dial fails; later drops are redialed silently.
    pub async fn connect(dialer: D, config: ChannelConfig) -> Result<Self, RpcError> {
        let conn = Arc::new(dialer.connect().await?);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            dialer,
            config,
            codec: JsonCodec,
            next_id: AtomicU64::new(1),
            metadata: RwLock::new(Metadata::new()),
            link: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            stream: Mutex::new(None),
            events,
            closed,
            supervisor: Mutex::new(None),
        });
        inner.install(Arc::clone(&conn));
        let task = tokio::spawn(supervise(Arc::clone(&inner), conn));
        *inner.supervisor.lock() = Some(task);
        Ok(Self { inner })
    }

    /// Subscribes to connection lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Sets a metadata entry sent with every later request.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.metadata.write().insert(key.into(), value.into());
    }

    /// Removes a metadata entry.
    pub fn remove_metadata(&self, key: &str) {
        self.inner.metadata.write().remove(key);
    }

    /// A copy of the current metadata.
    pub fn metadata(&self) -> Metadata {
        self.inner.metadata.read().clone()
    }

    /// Id of the live connection, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.link.read().as_ref().map(|c| c.id())
    }

    /// Whether a connection is up right now.
    pub fn is_connected(&self) -> bool {
        self.inner.link.read().is_some()
    }

    /// Sends a unary request and waits up to `timeout` for its response.
    ///
    /// A response with a nonzero reason code becomes [`RpcError::Status`].
    pub async fn call(
        &self,
        procedure: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let conn = self.inner.current()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request {
            id,
            procedure: procedure.to_string(),
            metadata: self.metadata(),
            payload,
        };
        let bytes = self.inner.codec.encode(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        if let Err(e) = conn.send(&bytes).await {
            self.inner.pending.lock().remove(&id);
            return Err(e.into());
        }
        debug!(id, procedure, conn = %conn.id(), "request sent");

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(RpcError::ConnectionLost),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                return Err(RpcError::Timeout {
                    procedure: procedure.to_string(),
                    after: timeout,
                });
            }
        };

        match reply {
            Frame::Response { code, payload, .. } if code == OK => Ok(payload),
            Frame::Response { code, message, .. } => Err(RpcError::Status {
                code: ErrorCode::from(code),
                message,
            }),
            other => Err(ProtocolError::InvalidMessage(format!(
                "expected Response, got {}",
                other.kind()
            ))
            .into()),
        }
    }

    /// [`call`](Self::call) with typed bodies.
    pub async fn invoke<Req, Resp>(
        &self,
        procedure: Procedure,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = self.inner.codec.encode(request)?;
        let reply = self.call(procedure.name(), payload, timeout).await?;
        Ok(self.inner.codec.decode(&reply)?)
    }

    /// Opens the duplex push stream on the live connection.
    ///
    /// Opening a new stream ends the previous one cleanly.
    pub async fn open_stream(
        &self,
    ) -> Result<(StreamSender<D::Connection>, StreamReceiver), RpcError> {
        let conn = self.inner.current()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.inner.stream.lock().replace(tx);
        drop(previous);

        let bytes = self.inner.codec.encode(&Frame::StreamOpen)?;
        if let Err(e) = conn.send(&bytes).await {
            self.inner.stream.lock().take();
            return Err(e.into());
        }
        debug!(conn = %conn.id(), "push stream opened");
        Ok((StreamSender::new(conn), StreamReceiver::new(rx)))
    }

    /// Stops redialing and closes the live connection.
    ///
    /// Pending calls fail with [`RpcError::ConnectionLost`], later ones with
    /// [`RpcError::Closed`].
    pub async fn close(&self) {
        self.inner.closed.send_replace(true);
        let task = self.inner.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "channel supervisor did not exit cleanly");
            }
        }
    }
}

impl<D: Dialer> Inner<D> {
    fn current(&self) -> Result<Arc<D::Connection>, RpcError> {
        if *self.closed.borrow() {
            return Err(RpcError::Closed);
        }
        self.link.read().clone().ok_or(RpcError::NotConnected)
    }

    fn install(&self, conn: Arc<D::Connection>) {
        let id = conn.id();
        *self.link.write() = Some(conn);
        info!(conn = %id, "connection established");
        let _ = self.events.send(ConnectionEvent::Established(id));
    }

    /// Forgets `conn` and fails everything that was riding on it.
    fn drop_link(&self, conn: &D::Connection) {
        let id = conn.id();
        {
            let mut link = self.link.write();
            if link.as_ref().is_some_and(|c| c.id() == id) {
                *link = None;
            }
        }
        // Dropping the senders wakes each caller with ConnectionLost.
        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            debug!(conn = %id, count = pending.len(), "failing in-flight calls");
        }
        drop(pending);
        if let Some(sink) = self.stream.lock().take() {
            let _ = sink.send(Err(RpcError::ConnectionLost));
        }
        info!(conn = %id, "connection closed");
        let _ = self.events.send(ConnectionEvent::Closed(id));
    }

    fn push_stream(&self, item: Result<tether_protocol::StreamMessage, RpcError>) {
        let stream = self.stream.lock();
        match stream.as_ref() {
            Some(sink) => {
                let _ = sink.send(item);
            }
            None => debug!("stream frame with no open stream, dropped"),
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// Reads frames off the live connection; redials when it drops.
async fn supervise<D: Dialer>(inner: Arc<Inner<D>>, mut conn: Arc<D::Connection>) {
    let mut closed = inner.closed.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => {
                if let Err(e) = conn.close().await {
                    debug!(conn = %conn.id(), error = %e, "close on shutdown failed");
                }
                inner.drop_link(&conn);
                return;
            }
            _ = read_loop(&inner, &conn) => {}
        }
        inner.drop_link(&conn);

        conn = loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => return,
                _ = tokio::time::sleep(inner.config.redial_backoff) => {}
            }
            let dialed = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => return,
                dialed = inner.dialer.connect() => dialed,
            };
            match dialed {
                Ok(c) => break Arc::new(c),
                Err(e) => warn!(error = %e, "redial failed"),
            }
        };
        inner.install(Arc::clone(&conn));
    }
}

async fn read_loop<D: Dialer>(inner: &Inner<D>, conn: &D::Connection) {
    loop {
        let data = match conn.recv().await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(conn = %conn.id(), "closed by peer");
                return;
            }
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "receive failed");
                return;
            }
        };
        let frame: Frame = match inner.codec.decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "dropping undecodable frame");
                continue;
            }
        };
        match frame {
            Frame::Response { id, .. } => {
                let waiter = inner.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => debug!(id, "response for unknown or expired call"),
                }
            }
            Frame::StreamData { message } => inner.push_stream(Ok(message)),
            Frame::StreamError {
                procedure,
                code,
                message,
            } => {
                warn!(procedure, code, %message, "stream message rejected");
                inner.push_stream(Err(RpcError::Status {
                    code: ErrorCode::from(code),
                    message,
                }));
            }
            Frame::StreamClose => {
                debug!(conn = %conn.id(), "server closed the push stream");
                inner.stream.lock().take();
            }
            other => debug!(kind = other.kind(), "ignoring unexpected frame"),
        }
    }
}
