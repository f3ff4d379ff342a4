//! WebSocket transport for agent connections
//!
//! Agents connect with an HTTP upgrade request on a configurable path. The
//! upgrade request is handed to [`ConnectionHandler::on_connecting`] before the
//! socket is upgraded, so a rejected agent receives a plain HTTP error status
//! and never reaches the control plane.
//!
//! Every WebSocket binary message carries exactly one protocol message encoded
//! with [`fleet_proto::encode_frame`].
//!
//! [`ConnectionHandler::on_connecting`]: fleet_transport::ConnectionHandler::on_connecting

pub mod config;
pub mod connection;
pub mod endpoint;

pub use config::WebSocketConfig;
pub use connection::WebSocketConnection;
pub use endpoint::WebSocketEndpoint;
