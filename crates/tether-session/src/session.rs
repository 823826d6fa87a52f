//! A single session record and its push-stream handle.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tether_protocol::{ClientId, StreamMessage};
use tether_transport::ConnectionId;
use tokio::sync::mpsc;

/// Where messages pushed to a node go: the outbound half of that node's
/// push stream, drained by its connection task.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    tx: mpsc::UnboundedSender<StreamMessage>,
}

impl StreamHandle {
    /// Wraps the sending half of a stream's outbound queue.
    pub fn new(tx: mpsc::UnboundedSender<StreamMessage>) -> Self {
        Self { tx }
    }

    /// Queues one message. Fails if the stream has gone away.
    pub fn send(&self, message: StreamMessage) -> Result<(), StreamMessage> {
        self.tx.send(message).map_err(|e| e.0)
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The server's record of one live connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Transport connection this session belongs to. Primary key.
    pub key: ConnectionId,

    /// Node identity, empty until phase II.
    pub identity: ClientId,

    /// Push stream, once the node has sent `Initiate`.
    pub stream: Option<StreamHandle>,

    /// When the connection was reported.
    pub connected_at: Instant,

    /// Unix seconds of the last bind or stream change.
    pub update_time: u64,
}

impl Session {
    pub(crate) fn new(key: ConnectionId) -> Self {
        Self {
            key,
            identity: ClientId::default(),
            stream: None,
            connected_at: Instant::now(),
            update_time: unix_now(),
        }
    }

    /// Whether phase II has completed.
    pub fn is_bound(&self) -> bool {
        !self.identity.is_empty()
    }

    pub(crate) fn touch(&mut self) {
        self.update_time = unix_now();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
