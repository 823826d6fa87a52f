//! Per-connection handler: frame routing between a transport connection
//! and the [`ServerProtocol`].
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Report the connection to the session layer (phase I)
//!   2. Loop: receive frames → spawn unary calls, run stream messages in
//!      order, forward queued pushes
//!   3. On exit, end the session (its node goes offline if still bound)

use std::sync::Arc;

use tether_protocol::{Codec, ErrorCode, Frame, JsonCodec, StreamMessage};
use tether_session::StreamHandle;
use tether_store::TableStore;
use tether_transport::{Connection, ConnectionId};
use tokio::sync::mpsc;

use crate::protocol::{CallContext, ServerProtocol};
use crate::{ServerHooks, TetherError};

/// Ends the session if the handler task unwinds or is aborted.
///
/// Since `Drop` is synchronous, we spawn a fire-and-forget task for the
/// async cleanup. A clean exit disarms the guard and cleans up inline.
struct SessionGuard<S: TableStore, H: ServerHooks> {
    key: ConnectionId,
    protocol: Arc<ServerProtocol<S, H>>,
    armed: bool,
}

impl<S: TableStore, H: ServerHooks> SessionGuard<S, H> {
    async fn finish(mut self) {
        self.armed = false;
        if let Err(e) = self.protocol.connection_end(self.key).await {
            tracing::warn!(conn = %self.key, error = %e, "session cleanup failed");
        }
    }
}

impl<S: TableStore, H: ServerHooks> Drop for SessionGuard<S, H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let key = self.key;
        let protocol = Arc::clone(&self.protocol);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = protocol.connection_end(key).await {
                    tracing::warn!(conn = %key, error = %e, "session cleanup failed");
                }
            });
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C, S, H>(
    conn: C,
    protocol: Arc<ServerProtocol<S, H>>,
) -> Result<(), TetherError>
where
    C: Connection,
    S: TableStore,
    H: ServerHooks,
{
    let conn = Arc::new(conn);
    let key = conn.id();
    tracing::debug!(conn = %key, "handling new connection");

    protocol.connection_begin(key);
    let guard = SessionGuard {
        key,
        protocol: Arc::clone(&protocol),
        armed: true,
    };

    let result = serve(&conn, &protocol).await;

    guard.finish().await;
    tracing::debug!(conn = %key, "connection handler finished");
    result
}

async fn serve<C, S, H>(
    conn: &Arc<C>,
    protocol: &Arc<ServerProtocol<S, H>>,
) -> Result<(), TetherError>
where
    C: Connection,
    S: TableStore,
    H: ServerHooks,
{
    let key = conn.id();
    let codec = JsonCodec;
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<StreamMessage>();
    let handle = StreamHandle::new(push_tx);
    let mut stream_open = false;

    loop {
        let data = tokio::select! {
            received = conn.recv() => match received {
                Ok(Some(data)) => data,
                Ok(None) => {
                    tracing::info!(conn = %key, "connection closed cleanly");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(conn = %key, error = %e, "recv error");
                    return Ok(());
                }
            },
            Some(message) = push_rx.recv() => {
                send_frame(conn.as_ref(), &codec, &Frame::StreamData { message }).await?;
                continue;
            }
        };

        let frame: Frame = match codec.decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(conn = %key, error = %e, "failed to decode frame");
                continue;
            }
        };

        match frame {
            Frame::Request {
                id,
                procedure,
                metadata,
                payload,
            } => {
                // Unary calls run off the receive loop so a slow store write
                // doesn't hold up the stream.
                let conn = Arc::clone(conn);
                let protocol = Arc::clone(protocol);
                tokio::spawn(async move {
                    let ctx = CallContext::new(conn.id(), metadata);
                    let reply = match protocol.dispatch(&ctx, &procedure, &payload).await {
                        Ok(payload) => Frame::ok(id, payload),
                        Err(e) => {
                            tracing::debug!(conn = %ctx.conn, %procedure, error = %e, "call failed");
                            Frame::error(id, e.code(), e.to_string())
                        }
                    };
                    if let Err(e) = send_frame(conn.as_ref(), &JsonCodec, &reply).await {
                        tracing::debug!(conn = %ctx.conn, error = %e, "failed to send response");
                    }
                });
            }
            Frame::StreamOpen => {
                stream_open = true;
                tracing::debug!(conn = %key, "push stream opened");
            }
            Frame::StreamData { message } => {
                let procedure = message.procedure;
                let reply = if !stream_open {
                    Frame::StreamError {
                        procedure,
                        code: ErrorCode::IllegalState.as_u16(),
                        message: "stream is not open".to_string(),
                    }
                } else {
                    match protocol.handle_stream(key, message, &handle) {
                        Ok(Some(message)) => Frame::StreamData { message },
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::debug!(conn = %key, procedure, error = %e, "stream message rejected");
                            Frame::StreamError {
                                procedure,
                                code: e.code().as_u16(),
                                message: e.to_string(),
                            }
                        }
                    }
                };
                send_frame(conn.as_ref(), &codec, &reply).await?;
            }
            Frame::StreamClose => {
                if stream_open {
                    stream_open = false;
                    protocol.stream_closed(key);
                    send_frame(conn.as_ref(), &codec, &Frame::StreamClose).await?;
                    tracing::debug!(conn = %key, "push stream closed");
                }
            }
            other => {
                tracing::debug!(conn = %key, kind = other.kind(), "ignoring unexpected frame");
            }
        }
    }
}

async fn send_frame<C: Connection>(
    conn: &C,
    codec: &JsonCodec,
    frame: &Frame,
) -> Result<(), TetherError> {
    let bytes = codec.encode(frame)?;
    conn.send(&bytes).await?;
    Ok(())
}
