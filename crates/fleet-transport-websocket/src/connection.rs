//! WebSocket connection handle and writer task

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use fleet_proto::{encode_frame, ServerToAgent};
use fleet_transport::{AgentConnection, ConnectionId, TransportError, TransportResult};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Outbound half of an upgraded agent WebSocket.
///
/// Messages are queued on a bounded channel and written by a dedicated writer
/// task, so a slow agent only ever blocks its own senders.
pub struct WebSocketConnection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    /// Channel for sending frames to the writer task
    outbound: mpsc::Sender<Message>,
    /// Cancelled when either side closes the connection
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WebSocketConnection {
    /// Wrap the sending half of a socket and spawn its writer task
    pub(crate) fn spawn(
        sink: SplitSink<WebSocket, Message>,
        remote_addr: Option<SocketAddr>,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let id = ConnectionId::new();
        let (outbound, rx) = mpsc::channel(queue_depth);
        let shutdown = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(Self::writer_task(
            sink,
            rx,
            shutdown.clone(),
            closed.clone(),
            id,
        ));

        (
            Self {
                id,
                remote_addr,
                outbound,
                shutdown,
                closed,
            },
            writer,
        )
    }

    /// Token cancelled once the connection is closed from either side
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue a keep-alive ping; skipped when the queue is full
    pub(crate) fn ping(&self) {
        if self
            .outbound
            .try_send(Message::Ping(Bytes::from_static(b"fleet")))
            .is_err()
        {
            trace!(connection_id = %self.id, "Skipping keep-alive ping, queue full");
        }
    }

    /// Writer task - drains the outbound queue into the socket
    async fn writer_task(
        mut sink: SplitSink<WebSocket, Message>,
        mut rx: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
        closed: Arc<AtomicBool>,
        id: ConnectionId,
    ) {
        loop {
            tokio::select! {
                biased;
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = sink.send(message).await {
                        warn!(connection_id = %id, error = %e, "WebSocket send error");
                        break;
                    }
                }
                _ = shutdown.cancelled() => {
                    // Flush what was queued before the close
                    while let Ok(message) = rx.try_recv() {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        shutdown.cancel();
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        debug!(connection_id = %id, "WebSocket writer task ended");
    }
}

#[async_trait]
impl AgentConnection for WebSocketConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn send(&self, message: &ServerToAgent) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let frame = encode_frame(message)?;
        trace!(connection_id = %self.id, len = frame.len(), "Queueing frame");

        self.outbound
            .send(Message::Binary(Bytes::from(frame)))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }
}
