//! Transport-facing handler: handshake, dispatch and disconnect

use async_trait::async_trait;
use fleet_auth::{AssignmentResolver, CredentialVerifier};
use fleet_proto::{AgentToServer, ServerToAgent};
use fleet_transport::{ConnectRequest, ConnectionHandler, ConnectionId, ConnectionRef, Rejection};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::registry::AgentRegistry;
use crate::{AgentId, Assignment};

/// Names of the request headers carrying out-of-band assignment hints
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub group_header: String,
    pub deployment_header: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            group_header: "agent-group".to_string(),
            deployment_header: "deployment".to_string(),
        }
    }
}

impl ServerSettings {
    pub fn with_group_header(mut self, name: &str) -> Self {
        self.group_header = name.to_string();
        self
    }

    pub fn with_deployment_header(mut self, name: &str) -> Self {
        self.deployment_header = name.to_string();
        self
    }
}

/// Bridges transport callbacks to the [`AgentRegistry`]
pub struct ControlPlaneServer {
    registry: AgentRegistry,
    verifier: Arc<dyn CredentialVerifier>,
    resolver: Arc<dyn AssignmentResolver>,
    settings: ServerSettings,
}

impl std::fmt::Debug for ControlPlaneServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneServer")
            .field("agents", &self.registry.count())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ControlPlaneServer {
    pub fn new(
        registry: AgentRegistry,
        verifier: Arc<dyn CredentialVerifier>,
        resolver: Arc<dyn AssignmentResolver>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            registry,
            verifier,
            resolver,
            settings,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }
}

#[async_trait]
impl ConnectionHandler for ControlPlaneServer {
    type Context = Assignment;

    /// Authenticate the credential and resolve the requested group/deployment.
    /// Nothing is registered unless every step succeeds.
    async fn on_connecting(&self, request: &ConnectRequest) -> Result<Assignment, Rejection> {
        let remote = request
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let Some(token) = request.bearer_token() else {
            warn!(remote_addr = %remote, "Rejecting agent without bearer credential");
            return Err(Rejection::unauthorized("missing bearer credential"));
        };

        let tenant_id = self.verifier.verify(token).await.map_err(|e| {
            warn!(remote_addr = %remote, error = %e, "Rejecting agent: credential verification failed");
            Rejection::unauthorized(e.to_string())
        })?;

        let group_name = request
            .header(&self.settings.group_header)
            .map(str::trim)
            .unwrap_or_default();
        let deployment_name = request
            .header(&self.settings.deployment_header)
            .map(str::trim)
            .unwrap_or_default();

        let resolved = self
            .resolver
            .resolve(group_name, deployment_name)
            .await
            .map_err(|e| {
                warn!(
                    remote_addr = %remote,
                    tenant_id = %tenant_id,
                    group = %group_name,
                    deployment = %deployment_name,
                    error = %e,
                    "Rejecting agent: assignment resolution failed"
                );
                Rejection::unauthorized(e.to_string())
            })?;

        info!(
            remote_addr = %remote,
            tenant_id = %tenant_id,
            group_id = %resolved.group_id,
            deployment_id = %resolved.deployment_id,
            "Agent authorized"
        );

        Ok(Assignment::new(
            tenant_id,
            resolved.group_id,
            resolved.deployment_id,
        ))
    }

    /// Every accepted connection becomes a new agent with a fresh identifier
    async fn on_connected(&self, connection: ConnectionRef, assignment: Assignment) {
        let connection_id = connection.connection_id();
        let id = AgentId::new();

        if let Err(e) = self.registry.create_or_attach(id, connection.clone()) {
            error!("Failed to register agent on {}: {}", connection_id, e);
            let _ = connection.close().await;
            return;
        }

        if let Err(e) = self.registry.set_assignment(connection_id, &assignment) {
            // Only possible if the connection closed in between
            warn!("Failed to assign agent {}: {}", id, e);
        }
    }

    async fn on_message(
        &self,
        connection: ConnectionId,
        message: AgentToServer,
    ) -> Option<ServerToAgent> {
        let reply = self.registry.update_status(connection, message);
        if reply.is_none() {
            debug!(connection_id = %connection, "No reply for stray message");
        }
        reply
    }

    async fn on_disconnect(&self, connection: ConnectionId) {
        self.registry.remove(connection);
    }
}
