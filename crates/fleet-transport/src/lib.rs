//! Transport abstraction layer for agent connections
//!
//! The control plane never talks to sockets directly. A transport accepts
//! connections, asks a [`ConnectionHandler`] whether to admit them, and then
//! hands every decoded [`AgentToServer`] message to the handler, in order, on a
//! single task per connection. Outbound traffic goes through the
//! [`AgentConnection`] handle.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            fleet-control (core)              │
//! │   ConnectionHandler impl, AgentRegistry      │
//! └──────────────────────────────────────────────┘
//!                       │ uses traits
//!                       ↓
//! ┌──────────────────────────────────────────────┐
//! │          fleet-transport (this crate)        │
//! │   AgentConnection   ConnectionHandler        │
//! └──────────────────────────────────────────────┘
//!                       │ implemented by
//!                       ↓
//! ┌──────────────────────────────────────────────┐
//! │          fleet-transport-websocket           │
//! └──────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use fleet_proto::{AgentToServer, CodecError, ServerToAgent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Identifies one accepted transport connection for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of an accepted agent connection
#[async_trait]
pub trait AgentConnection: Send + Sync + Debug {
    fn connection_id(&self) -> ConnectionId;

    /// Remote peer address, when the transport knows it
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Queue a message for the agent.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is closed.
    async fn send(&self, message: &ServerToAgent) -> TransportResult<()>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> TransportResult<()>;

    fn is_closed(&self) -> bool;
}

/// Shared handle to a connection
pub type ConnectionRef = Arc<dyn AgentConnection>;

/// Inbound connection attempt, as seen before it is accepted
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub remote_addr: Option<SocketAddr>,
    pub path: String,
    /// Header names are lowercased
    headers: HashMap<String, String>,
}

impl ConnectRequest {
    pub fn new(remote_addr: Option<SocketAddr>, path: impl Into<String>) -> Self {
        Self {
            remote_addr,
            path: path.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Token from an `Authorization: Bearer <token>` header
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?.trim();
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();
        (!token.is_empty()).then_some(token)
    }
}

/// Reason a connection attempt was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection rejected ({status}): {reason}")]
pub struct Rejection {
    /// HTTP-style status code reported to the peer
    pub status: u16,
    pub reason: String,
}

impl Rejection {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(401, reason)
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(403, reason)
    }
}

/// Connection lifecycle callbacks invoked by a transport.
///
/// For one connection the transport calls `on_connecting`, then (if accepted)
/// `on_connected`, then `on_message` for each inbound message in arrival order,
/// and finally `on_disconnect` exactly once.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// State produced by the handshake and handed to `on_connected`
    type Context: Send + 'static;

    /// Admission check, run before the connection is accepted
    async fn on_connecting(&self, request: &ConnectRequest) -> Result<Self::Context, Rejection>;

    async fn on_connected(&self, connection: ConnectionRef, context: Self::Context);

    /// Handle one inbound message; the returned message is sent back to the agent
    async fn on_message(
        &self,
        connection: ConnectionId,
        message: AgentToServer,
    ) -> Option<ServerToAgent>;

    async fn on_disconnect(&self, connection: ConnectionId);
}
