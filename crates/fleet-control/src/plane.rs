//! Control plane composition
//!
//! [`ControlPlane`] wires one registry into the transport handler and the
//! distributor, and exposes the operations outer layers (HTTP API, CLI) use.

use fleet_auth::{AssignmentResolver, CredentialVerifier};
use fleet_proto::{ConfigValue, ConnectionSettingsOffers};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::distributor::{ConfigDistributor, DistributorConfig, PushOutcome};
use crate::error::{ControlError, ControlResult};
use crate::registry::{AgentRegistry, Delivery};
use crate::server::{ControlPlaneServer, ServerSettings};
use crate::session::AgentSnapshot;
use crate::AgentId;

/// Which agents to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentFilter {
    All,
    Tenant(String),
    Group(String),
    Deployment(String),
}

/// Fleet size figures for periodic logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub agents: usize,
    pub tenants: usize,
    pub groups: usize,
    pub deployments: usize,
}

#[derive(Debug, Clone)]
pub struct ControlPlane {
    registry: AgentRegistry,
    server: Arc<ControlPlaneServer>,
    distributor: ConfigDistributor,
}

impl ControlPlane {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        resolver: Arc<dyn AssignmentResolver>,
        settings: ServerSettings,
        distributor_config: DistributorConfig,
    ) -> Self {
        let registry = AgentRegistry::new();
        let server = Arc::new(ControlPlaneServer::new(
            registry.clone(),
            verifier,
            resolver,
            settings,
        ));
        let distributor = ConfigDistributor::new(registry.clone(), distributor_config);

        Self {
            registry,
            server,
            distributor,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Connection handler to mount on a transport
    pub fn server(&self) -> Arc<ControlPlaneServer> {
        self.server.clone()
    }

    pub fn distributor(&self) -> &ConfigDistributor {
        &self.distributor
    }

    pub fn list_agents(&self, filter: &AgentFilter) -> Vec<AgentSnapshot> {
        match filter {
            AgentFilter::All => self.registry.snapshot(),
            AgentFilter::Tenant(tenant_id) => self.registry.snapshot_by_tenant(tenant_id),
            AgentFilter::Group(group_id) => self.registry.snapshot_by_group(group_id),
            AgentFilter::Deployment(deployment_id) => {
                self.registry.snapshot_by_deployment(deployment_id)
            }
        }
    }

    pub fn agent(&self, id: AgentId) -> ControlResult<AgentSnapshot> {
        self.registry.find(id).ok_or(ControlError::AgentNotFound(id))
    }

    pub fn get_config(&self, id: AgentId) -> ControlResult<Option<ConfigValue>> {
        self.distributor.get_config(id)
    }

    pub async fn update_config(
        &self,
        id: AgentId,
        change: &ConfigValue,
        wait: bool,
        timeout: Option<Duration>,
    ) -> ControlResult<PushOutcome> {
        self.distributor.update_config(id, change, wait, timeout).await
    }

    pub async fn update_config_with_cancel(
        &self,
        id: AgentId,
        change: &ConfigValue,
        wait: bool,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ControlResult<PushOutcome> {
        self.distributor
            .update_config_with_cancel(id, change, wait, timeout, cancel)
            .await
    }

    /// Forward a connection settings offer (e.g. rotated credentials)
    pub async fn offer_connection_settings(
        &self,
        id: AgentId,
        offers: ConnectionSettingsOffers,
    ) -> ControlResult<()> {
        match self.registry.offer_connection_settings(id, offers).await? {
            Delivery::Sent => Ok(()),
            Delivery::UnknownAgent => Err(ControlError::AgentNotFound(id)),
        }
    }

    pub fn summary(&self) -> FleetSummary {
        let (tenants, groups, deployments) = self.registry.assignment_counts();
        FleetSummary {
            agents: self.registry.count(),
            tenants,
            groups,
            deployments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Assignment;
    use fleet_auth::{InMemoryAssignmentResolver, StaticTokenVerifier};
    use fleet_proto::OpAmpConnectionSettings;
    use fleet_transport::test_support::MockConnection;
    use fleet_transport::{AgentConnection, ConnectionHandler};

    fn plane() -> ControlPlane {
        ControlPlane::new(
            Arc::new(StaticTokenVerifier::new().with_token("secret", "acme")),
            Arc::new(InMemoryAssignmentResolver::new()),
            ServerSettings::default(),
            DistributorConfig::default(),
        )
    }

    async fn connect(plane: &ControlPlane, assignment: Assignment) -> (AgentId, Arc<MockConnection>) {
        let connection = MockConnection::new();
        plane.server().on_connected(connection.handle(), assignment).await;
        let id = plane
            .registry()
            .find_by_connection(connection.connection_id())
            .unwrap();
        (id, connection)
    }

    #[tokio::test]
    async fn test_list_agents_by_filter() {
        let plane = plane();
        let (a, _ca) = connect(&plane, Assignment::new("acme", "g1", "d1")).await;
        let (b, _cb) = connect(&plane, Assignment::new("acme", "g2", "d1")).await;
        let (c, _cc) = connect(&plane, Assignment::new("other", "g2", "d2")).await;

        assert_eq!(plane.list_agents(&AgentFilter::All).len(), 3);

        let ids = |filter: AgentFilter| {
            let mut ids: Vec<AgentId> = plane.list_agents(&filter).iter().map(|s| s.id).collect();
            ids.sort();
            ids
        };
        let sorted = |mut v: Vec<AgentId>| {
            v.sort();
            v
        };

        assert_eq!(ids(AgentFilter::Tenant("acme".into())), sorted(vec![a, b]));
        assert_eq!(ids(AgentFilter::Group("g2".into())), sorted(vec![b, c]));
        assert_eq!(ids(AgentFilter::Deployment("d2".into())), vec![c]);
        assert!(ids(AgentFilter::Tenant("nobody".into())).is_empty());
    }

    #[tokio::test]
    async fn test_summary_tracks_connects_and_disconnects() {
        let plane = plane();
        assert_eq!(plane.summary(), FleetSummary::default());

        let (_a, first) = connect(&plane, Assignment::new("acme", "g1", "d1")).await;
        let (_b, _second) = connect(&plane, Assignment::new("acme", "g2", "d1")).await;
        assert_eq!(
            plane.summary(),
            FleetSummary {
                agents: 2,
                tenants: 1,
                groups: 2,
                deployments: 1,
            }
        );

        plane.server().on_disconnect(first.connection_id()).await;
        assert_eq!(
            plane.summary(),
            FleetSummary {
                agents: 1,
                tenants: 1,
                groups: 1,
                deployments: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_offer_connection_settings() {
        let plane = plane();
        let (id, connection) = connect(&plane, Assignment::tenant("acme")).await;

        let offers = ConnectionSettingsOffers {
            hash: vec![1, 2, 3],
            opamp: Some(OpAmpConnectionSettings {
                destination_endpoint: "wss://fleet.example/v1/opamp".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        plane.offer_connection_settings(id, offers.clone()).await.unwrap();
        assert_eq!(connection.last_sent().unwrap().connection_settings, Some(offers));

        let missing = plane
            .offer_connection_settings(AgentId::new(), ConnectionSettingsOffers::default())
            .await;
        assert!(matches!(missing, Err(ControlError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn test_agent_lookup() {
        let plane = plane();
        let (id, _connection) = connect(&plane, Assignment::tenant("acme")).await;

        assert_eq!(plane.agent(id).unwrap().assignment.tenant_id, "acme");
        assert!(matches!(
            plane.agent(AgentId::new()),
            Err(ControlError::AgentNotFound(_))
        ));
        assert_eq!(plane.get_config(id).unwrap(), None);
    }
}
