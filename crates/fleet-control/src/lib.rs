//! Control plane for a fleet of collector agents
//!
//! - [`AgentRegistry`]: every connected agent, the connection → agent mapping
//!   and the tenant / group / deployment indexes, all behind one lock.
//! - [`AgentSession`]: one agent's live state and its status/ack state machine.
//! - [`ControlPlaneServer`]: transport callbacks (handshake, dispatch, disconnect).
//! - [`ConfigDistributor`]: merge a partial change into an agent's config, push
//!   it, and optionally wait for the agent to confirm.

pub mod distributor;
pub mod error;
pub mod index;
pub mod plane;
pub mod registry;
pub mod server;
pub mod session;

pub use distributor::{ConfigDistributor, DistributorConfig, PushOutcome, Unconfirmed};
pub use error::{ControlError, ControlResult};
pub use plane::{AgentFilter, ControlPlane, FleetSummary};
pub use registry::{AgentRegistry, Delivery};
pub use server::{ControlPlaneServer, ServerSettings};
pub use session::{AckEvent, AckSignal, AgentSession, AgentSnapshot, AgentStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned agent identifier, allocated once per accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Tenant / group / deployment membership. Empty strings mean unassigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub tenant_id: String,
    pub group_id: String,
    pub deployment_id: String,
}

impl Assignment {
    pub fn new(
        tenant_id: impl Into<String>,
        group_id: impl Into<String>,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: group_id.into(),
            deployment_id: deployment_id.into(),
        }
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, "", "")
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self::new("", group_id, "")
    }
}
