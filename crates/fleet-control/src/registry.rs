//! Agent registry
//!
//! Single source of truth for which agents are connected and what they belong
//! to. Sessions, the connection → agent mapping and the three assignment
//! indexes live behind one `RwLock`, and every mutation that touches more than
//! one of them completes while holding the write lock. Nothing outside the
//! registry ever sees a live session: readers get [`AgentSnapshot`] copies.
//!
//! No I/O happens under the lock. Pushes record their state, release the lock,
//! then send.

use fleet_proto::{AgentRemoteConfig, AgentToServer, ConnectionSettingsOffers, ServerToAgent};
use fleet_transport::{ConnectionId, ConnectionRef};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::index::AssignmentIndex;
use crate::session::{AckEvent, AckSignal, AgentSession, AgentSnapshot};
use crate::{AgentId, Assignment};

/// Result of handing a message to the registry for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the agent's connection
    Sent,
    /// No session with that id; nothing was sent
    UnknownAgent,
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<AgentId, AgentSession>,
    connection_to_agent: HashMap<ConnectionId, AgentId>,
    tenants: AssignmentIndex,
    groups: AssignmentIndex,
    deployments: AssignmentIndex,
}

impl RegistryState {
    fn snapshots<I>(&self, ids: I) -> Vec<AgentSnapshot>
    where
        I: IntoIterator<Item = AgentId>,
    {
        ids.into_iter()
            .filter_map(|id| self.sessions.get(&id))
            .map(AgentSession::clone_readonly)
            .collect()
    }

    /// Update the non-empty, changed fields of an agent's assignment and move
    /// it between index buckets accordingly.
    fn apply_assignment(&mut self, id: AgentId, assignment: &Assignment) -> Option<AgentSnapshot> {
        let RegistryState {
            sessions,
            tenants,
            groups,
            deployments,
            ..
        } = self;
        let session = sessions.get_mut(&id)?;
        let current = &mut session.assignment;

        for (index, field, new_value) in [
            (tenants, &mut current.tenant_id, &assignment.tenant_id),
            (groups, &mut current.group_id, &assignment.group_id),
            (deployments, &mut current.deployment_id, &assignment.deployment_id),
        ] {
            if new_value.is_empty() || *field == *new_value {
                continue;
            }
            index.relocate(id, field, new_value);
            *field = new_value.clone();
        }

        Some(session.clone_readonly())
    }

    /// Checks every invariant tying sessions, connections and indexes together
    #[cfg(test)]
    fn check_invariants(&self) -> Result<(), String> {
        for (connection, id) in &self.connection_to_agent {
            let session = self
                .sessions
                .get(id)
                .ok_or_else(|| format!("{connection} maps to missing agent {id}"))?;
            if session.connection_id() != *connection {
                return Err(format!("{connection} maps to {id} which holds another connection"));
            }
        }
        if self.connection_to_agent.len() != self.sessions.len() {
            return Err("session without connection mapping".to_string());
        }

        fn tenant(a: &Assignment) -> &String {
            &a.tenant_id
        }
        fn group(a: &Assignment) -> &String {
            &a.group_id
        }
        fn deployment(a: &Assignment) -> &String {
            &a.deployment_id
        }

        let indexes: [(&str, &AssignmentIndex, fn(&Assignment) -> &String); 3] = [
            ("tenant", &self.tenants, tenant),
            ("group", &self.groups, group),
            ("deployment", &self.deployments, deployment),
        ];
        for (name, index, field) in indexes {
            for (key, members) in index.buckets() {
                if members.is_empty() {
                    return Err(format!("empty {name} bucket {key}"));
                }
                for id in members {
                    let session = self
                        .sessions
                        .get(id)
                        .ok_or_else(|| format!("stale {name} entry {id} in {key}"))?;
                    if field(&session.assignment) != key {
                        return Err(format!("{id} in {name} bucket {key} with mismatched assignment"));
                    }
                }
            }
            for (id, session) in &self.sessions {
                let value = field(&session.assignment);
                if !value.is_empty() && !index.contains(value, *id) {
                    return Err(format!("{id} missing from {name} bucket {value}"));
                }
            }
        }
        Ok(())
    }
}

/// Registry of connected agents
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl AgentRegistry {
    /// Create a new empty agent registry
    pub fn new() -> Self {
        tracing::info!("Creating new agent registry");
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a session for `id` anchored to `connection`.
    ///
    /// If a session for `id` already exists it is returned unchanged. A
    /// connection already attached to a different agent is refused.
    pub fn create_or_attach(
        &self,
        id: AgentId,
        connection: ConnectionRef,
    ) -> ControlResult<AgentSnapshot> {
        let connection_id = connection.connection_id();
        let mut state = self.write();

        if let Some(owner) = state.connection_to_agent.get(&connection_id) {
            if *owner != id {
                warn!(
                    agent_id = %id,
                    connection_id = %connection_id,
                    owner = %owner,
                    "Connection already attached to another agent"
                );
                return Err(ControlError::ConnectionAlreadyAttached {
                    connection: connection_id,
                    agent: *owner,
                });
            }
        }

        if let Some(existing) = state.sessions.get(&id) {
            debug!(agent_id = %id, "Agent already registered, attach is a no-op");
            return Ok(existing.clone_readonly());
        }

        let session = AgentSession::new(id, connection);
        let snapshot = session.clone_readonly();
        state.sessions.insert(id, session);
        state.connection_to_agent.insert(connection_id, id);

        info!(
            agent_id = %id,
            connection_id = %connection_id,
            agents = state.sessions.len(),
            "Registered agent"
        );
        Ok(snapshot)
    }

    pub fn find(&self, id: AgentId) -> Option<AgentSnapshot> {
        self.read().sessions.get(&id).map(AgentSession::clone_readonly)
    }

    pub fn find_by_connection(&self, connection: ConnectionId) -> Option<AgentId> {
        self.read().connection_to_agent.get(&connection).copied()
    }

    /// Update the assignment of the agent owning `connection`.
    ///
    /// Empty fields are left untouched, so a partial assignment only moves the
    /// agent in the indexes whose value actually changed.
    pub fn set_assignment(
        &self,
        connection: ConnectionId,
        assignment: &Assignment,
    ) -> ControlResult<AgentSnapshot> {
        let mut state = self.write();
        let id = state
            .connection_to_agent
            .get(&connection)
            .copied()
            .ok_or(ControlError::ConnectionNotFound(connection))?;

        let snapshot = state
            .apply_assignment(id, assignment)
            .ok_or(ControlError::AgentNotFound(id))?;

        info!(
            agent_id = %id,
            tenant_id = %snapshot.assignment.tenant_id,
            group_id = %snapshot.assignment.group_id,
            deployment_id = %snapshot.assignment.deployment_id,
            "Agent assignment updated"
        );
        Ok(snapshot)
    }

    /// Same as [`set_assignment`](Self::set_assignment), addressed by agent id
    pub fn reassign(&self, id: AgentId, assignment: &Assignment) -> ControlResult<AgentSnapshot> {
        let snapshot = self
            .write()
            .apply_assignment(id, assignment)
            .ok_or(ControlError::AgentNotFound(id))?;

        info!(
            agent_id = %id,
            tenant_id = %snapshot.assignment.tenant_id,
            group_id = %snapshot.assignment.group_id,
            deployment_id = %snapshot.assignment.deployment_id,
            "Agent reassigned"
        );
        Ok(snapshot)
    }

    /// Remove the session owning `connection` along with all its index entries.
    ///
    /// This is the only deletion path. Removing an unknown or already removed
    /// connection is a no-op. A pending ack resolves as
    /// [`AckEvent::Disconnected`].
    pub fn remove(&self, connection: ConnectionId) -> Option<AgentSnapshot> {
        let (snapshot, pending_ack, remaining) = {
            let mut state = self.write();
            let Some(id) = state.connection_to_agent.remove(&connection) else {
                debug!(connection_id = %connection, "Remove for unknown connection ignored");
                return None;
            };
            let mut session = state.sessions.remove(&id)?;

            let assignment = &session.assignment;
            state.tenants.remove(&assignment.tenant_id, id);
            state.groups.remove(&assignment.group_id, id);
            state.deployments.remove(&assignment.deployment_id, id);

            let pending_ack = session.take_pending_ack();
            (session.clone_readonly(), pending_ack, state.sessions.len())
        };

        if let Some(ack) = pending_ack {
            ack.fire(AckEvent::Disconnected);
        }

        info!(
            agent_id = %snapshot.id,
            connection_id = %connection,
            agents = remaining,
            "Unregistered agent"
        );
        Some(snapshot)
    }

    /// Record `config` as the agent's remote config and send it.
    ///
    /// An unknown agent is not an error here; the caller decides what
    /// [`Delivery::UnknownAgent`] means. A send failure is returned but leaves
    /// the session in place; only the transport's disconnect removes it.
    pub async fn push_config(
        &self,
        id: AgentId,
        config: AgentRemoteConfig,
        ack: Option<AckSignal>,
    ) -> ControlResult<Delivery> {
        let hash = config.hash_hex();
        let (connection, message) = {
            let mut state = self.write();
            let Some(session) = state.sessions.get_mut(&id) else {
                warn!(agent_id = %id, "Config push for unknown agent ignored");
                return Ok(Delivery::UnknownAgent);
            };
            let message = session.push_config(config, ack);
            (session.connection().clone(), message)
        };

        self.deliver(id, &connection, &message).await?;
        info!(agent_id = %id, config_hash = %hash, "Pushed remote config");
        Ok(Delivery::Sent)
    }

    /// Forward a connection settings offer to the agent
    pub async fn offer_connection_settings(
        &self,
        id: AgentId,
        offers: ConnectionSettingsOffers,
    ) -> ControlResult<Delivery> {
        let (connection, message) = {
            let state = self.read();
            let Some(session) = state.sessions.get(&id) else {
                warn!(agent_id = %id, "Connection settings offer for unknown agent ignored");
                return Ok(Delivery::UnknownAgent);
            };
            (
                session.connection().clone(),
                session.offer_connection_settings(offers),
            )
        };

        self.deliver(id, &connection, &message).await?;
        info!(agent_id = %id, "Offered connection settings");
        Ok(Delivery::Sent)
    }

    /// Apply a status report from `connection` and return the reply.
    ///
    /// `None` when the connection has no agent, e.g. a message racing its
    /// own disconnect.
    pub fn update_status(
        &self,
        connection: ConnectionId,
        report: AgentToServer,
    ) -> Option<ServerToAgent> {
        let mut state = self.write();
        let Some(id) = state.connection_to_agent.get(&connection).copied() else {
            warn!(connection_id = %connection, "Dropping status report from unregistered connection");
            return None;
        };
        let session = state.sessions.get_mut(&id)?;
        debug!(agent_id = %id, sequence_num = report.sequence_num, "Status report");
        Some(session.update_status(report))
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.read()
            .sessions
            .values()
            .map(AgentSession::clone_readonly)
            .collect()
    }

    pub fn snapshot_by_tenant(&self, tenant_id: &str) -> Vec<AgentSnapshot> {
        let state = self.read();
        state.snapshots(state.tenants.members(tenant_id))
    }

    pub fn snapshot_by_group(&self, group_id: &str) -> Vec<AgentSnapshot> {
        let state = self.read();
        state.snapshots(state.groups.members(group_id))
    }

    pub fn snapshot_by_deployment(&self, deployment_id: &str) -> Vec<AgentSnapshot> {
        let state = self.read();
        state.snapshots(state.deployments.members(deployment_id))
    }

    /// Number of connected agents
    pub fn count(&self) -> usize {
        self.read().sessions.len()
    }

    /// Distinct (tenants, groups, deployments) with at least one agent
    pub fn assignment_counts(&self) -> (usize, usize, usize) {
        let state = self.read();
        (
            state.tenants.len(),
            state.groups.len(),
            state.deployments.len(),
        )
    }

    async fn deliver(
        &self,
        id: AgentId,
        connection: &ConnectionRef,
        message: &ServerToAgent,
    ) -> ControlResult<()> {
        connection.send(message).await.map_err(|source| {
            warn!(
                agent_id = %id,
                connection_id = %connection.connection_id(),
                error = %source,
                "Failed to send to agent"
            );
            ControlError::Transport { agent: id, source }
        })
    }

    #[cfg(test)]
    fn check_invariants(&self) -> Result<(), String> {
        self.read().check_invariants()
    }
}
