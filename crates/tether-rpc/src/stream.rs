//! The two halves of the push stream.

use std::sync::Arc;

use tether_protocol::{Codec, Frame, JsonCodec, StreamMessage};
use tether_transport::Connection;
use tokio::sync::mpsc;

use crate::RpcError;

pub(crate) type StreamSink = mpsc::UnboundedSender<Result<StreamMessage, RpcError>>;

/// Sending half of a push stream. Bound to the connection it was opened on.
pub struct StreamSender<C> {
    conn: Arc<C>,
    codec: JsonCodec,
}

impl<C> Clone for StreamSender<C> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            codec: JsonCodec,
        }
    }
}

impl<C: Connection> StreamSender<C> {
    pub(crate) fn new(conn: Arc<C>) -> Self {
        Self {
            conn,
            codec: JsonCodec,
        }
    }

    /// Sends one message to the server.
    pub async fn send(&self, message: StreamMessage) -> Result<(), RpcError> {
        let bytes = self.codec.encode(&Frame::StreamData { message })?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    /// Tells the server the stream is done. The connection stays up.
    pub async fn close(&self) -> Result<(), RpcError> {
        let bytes = self.codec.encode(&Frame::StreamClose)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }
}

/// Receiving half of a push stream.
pub struct StreamReceiver {
    rx: mpsc::UnboundedReceiver<Result<StreamMessage, RpcError>>,
}

impl StreamReceiver {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<StreamMessage, RpcError>>) -> Self {
        Self { rx }
    }

    /// The next message from the server.
    ///
    /// `Ok(None)` means the stream ended cleanly: the server closed it or a
    /// newer stream replaced it. An error means the stream broke, usually
    /// because the connection dropped.
    pub async fn recv(&mut self) -> Result<Option<StreamMessage>, RpcError> {
        match self.rx.recv().await {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }
}
