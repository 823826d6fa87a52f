//! In-process transport: connections are pairs of unbounded channels.
//!
//! ```rust
//! # async fn demo() -> Result<(), tether_transport::TransportError> {
//! use tether_transport::{Connection, Dialer, MemoryTransport, Transport};
//!
//! let (mut transport, dialer) = MemoryTransport::new();
//! let client = dialer.connect().await?;
//! let server = transport.accept().await?;
//!
//! client.send(b"ping").await?;
//! assert_eq!(server.recv().await?, Some(b"ping".to_vec()));
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc, watch};

use crate::{Connection, ConnectionId, Dialer, Transport, TransportError};

/// Server half of the in-memory transport.
pub struct MemoryTransport {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryTransport {
    /// Creates a transport and the dialer that connects to it.
    pub fn new() -> (Self, MemoryDialer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = MemoryDialer {
            inner: Arc::new(DialerInner {
                accept: tx,
                live: SyncMutex::new(Vec::new()),
            }),
        };
        (Self { incoming: rx }, dialer)
    }
}

impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Shutdown)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct DialerInner {
    accept: mpsc::UnboundedSender<MemoryConnection>,
    /// Close flags of every pair this dialer created.
    live: SyncMutex<Vec<Arc<watch::Sender<bool>>>>,
}

/// Client half of the in-memory transport. Cheap to clone.
#[derive(Clone)]
pub struct MemoryDialer {
    inner: Arc<DialerInner>,
}

impl MemoryDialer {
    /// Closes every connection dialed so far, as if the network dropped.
    ///
    /// Both ends observe a clean close; later dials still succeed.
    pub fn sever_all(&self) {
        let live = std::mem::take(&mut *self.inner.live.lock());
        tracing::debug!(count = live.len(), "severing in-memory connections");
        for closed in live {
            closed.send_replace(true);
        }
    }
}

impl Dialer for MemoryDialer {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        let (client, server, closed) = MemoryConnection::pair();
        self.inner.accept.send(server).map_err(|_| {
            TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "in-memory transport is gone",
            ))
        })?;
        let mut live = self.inner.live.lock();
        live.retain(|c| !*c.borrow());
        live.push(closed);
        Ok(client)
    }
}

/// One end of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    tx: SyncMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    /// Two connected ends plus their shared close flag.
    fn pair() -> (Self, Self, Arc<watch::Sender<bool>>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let a = Self {
            id: ConnectionId::next(),
            tx: SyncMutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
            closed: Arc::clone(&closed),
        };
        let b = Self {
            id: ConnectionId::next(),
            tx: SyncMutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
            closed: Arc::clone(&closed),
        };
        (a, b, closed)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(self.id.to_string()));
        }
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| TransportError::ConnectionClosed(self.id.to_string())),
            None => Err(TransportError::ConnectionClosed(self.id.to_string())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => Ok(msg),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tx.lock().take();
        self.closed.send_replace(true);
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}
