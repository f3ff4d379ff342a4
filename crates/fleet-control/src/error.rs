//! Control plane errors

use fleet_proto::DocumentError;
use fleet_transport::{ConnectionId, TransportError};
use thiserror::Error;

use crate::AgentId;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Connection not registered: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Connection {connection} already belongs to agent {agent}")]
    ConnectionAlreadyAttached {
        connection: ConnectionId,
        agent: AgentId,
    },

    #[error("Failed to send to agent {agent}: {source}")]
    Transport {
        agent: AgentId,
        #[source]
        source: TransportError,
    },

    #[error("Config document error: {0}")]
    Document(#[from] DocumentError),
}

pub type ControlResult<T> = Result<T, ControlError>;
