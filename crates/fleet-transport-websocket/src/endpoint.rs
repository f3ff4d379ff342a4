//! HTTP upgrade endpoint and per-connection reader loop

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use fleet_proto::{decode_frame, AgentToServer};
use fleet_transport::{
    AgentConnection, ConnectRequest, ConnectionHandler, TransportError, TransportResult,
};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::connection::WebSocketConnection;

/// WebSocket endpoint serving one [`ConnectionHandler`]
pub struct WebSocketEndpoint<H> {
    handler: Arc<H>,
    config: Arc<WebSocketConfig>,
    shutdown: CancellationToken,
}

impl<H> Clone for WebSocketEndpoint<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<H> std::fmt::Debug for WebSocketEndpoint<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketEndpoint")
            .field("path", &self.config.path)
            .finish()
    }
}

impl<H: ConnectionHandler> WebSocketEndpoint<H> {
    pub fn new(handler: Arc<H>, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self {
            handler,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops the server and closes every open connection
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Router with the upgrade route mounted at the configured path
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config.path, get(upgrade::<H>))
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind a TCP listener, mapping failures to [`TransportError::BindError`]
    pub async fn bind(addr: SocketAddr) -> TransportResult<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })
    }

    /// Serve until the shutdown token is cancelled
    pub async fn serve(self, listener: TcpListener) -> TransportResult<()> {
        let local_addr = listener.local_addr().map_err(TransportError::IoError)?;
        info!(
            "WebSocket endpoint listening on ws://{}{}",
            local_addr, self.config.path
        );

        let shutdown = self.shutdown.clone();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(TransportError::IoError)?;

        info!("WebSocket endpoint stopped");
        Ok(())
    }
}

async fn upgrade<H: ConnectionHandler>(
    State(endpoint): State<WebSocketEndpoint<H>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let mut request = ConnectRequest::new(Some(remote_addr), uri.path());
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            request.insert_header(name.as_str(), value);
        }
    }

    let context = match endpoint.handler.on_connecting(&request).await {
        Ok(context) => context,
        Err(rejection) => {
            info!(
                remote_addr = %remote_addr,
                status = rejection.status,
                reason = %rejection.reason,
                "Rejected agent connection"
            );
            let status = StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::UNAUTHORIZED);
            return (status, rejection.reason).into_response();
        }
    };

    ws.max_message_size(endpoint.config.max_message_size)
        .on_upgrade(move |socket| run_connection(socket, endpoint, context, remote_addr))
}

/// Drive one upgraded connection until it closes.
///
/// Inbound frames are dispatched in arrival order; `on_disconnect` runs exactly
/// once when the loop ends, whatever the reason.
async fn run_connection<H: ConnectionHandler>(
    socket: WebSocket,
    endpoint: WebSocketEndpoint<H>,
    context: H::Context,
    remote_addr: SocketAddr,
) {
    let WebSocketEndpoint {
        handler,
        config,
        shutdown: server_shutdown,
    } = endpoint;

    let (sink, mut stream) = socket.split();
    let (connection, writer) =
        WebSocketConnection::spawn(sink, Some(remote_addr), config.outbound_queue);
    let connection = Arc::new(connection);
    let id = connection.connection_id();
    let closed = connection.shutdown_token();

    info!(connection_id = %id, remote_addr = %remote_addr, "Agent connection established");
    handler.on_connected(connection.clone(), context).await;

    let mut keep_alive = tokio::time::interval_at(
        Instant::now() + config.keep_alive_interval,
        config.keep_alive_interval,
    );
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(config.idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            frame = stream.next() => {
                idle.as_mut().reset(Instant::now() + config.idle_timeout);
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        match decode_frame::<AgentToServer>(&data) {
                            Ok(message) => {
                                if let Some(reply) = handler.on_message(id, message).await {
                                    if let Err(e) = connection.send(&reply).await {
                                        warn!(connection_id = %id, error = %e, "Failed to send reply");
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(connection_id = %id, error = %e, "Dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!(connection_id = %id, "Dropping unexpected text frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break "closed by agent",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "WebSocket read error");
                        break "read error";
                    }
                }
            }
            _ = &mut idle => break "idle timeout",
            _ = keep_alive.tick() => connection.ping(),
            _ = closed.cancelled() => break "closed by server",
            _ = server_shutdown.cancelled() => break "server shutting down",
        }
    };

    let _ = connection.close().await;
    handler.on_disconnect(id).await;
    let _ = writer.await;

    info!(connection_id = %id, remote_addr = %remote_addr, reason, "Agent connection closed");
}
