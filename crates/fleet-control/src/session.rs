//! Per-agent session state
//!
//! A session lives from the moment its connection is attached until the
//! transport reports the connection closed. It is owned by the
//! [`AgentRegistry`](crate::AgentRegistry) and only ever handed out as an
//! [`AgentSnapshot`] copy.

use chrono::{DateTime, Utc};
use fleet_proto::{
    server_flags, AgentDescription, AgentRemoteConfig, AgentToServer, ComponentHealth,
    ConfigValue, ConnectionSettingsOffers, RemoteConfigStatus, ServerToAgent,
};
use fleet_transport::{ConnectionId, ConnectionRef};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{AgentId, Assignment};

/// What resolved a pending push acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub enum AckEvent {
    /// The agent sent its next status report, carrying this remote config status
    StatusReported(Option<RemoteConfigStatus>),
    /// A newer push replaced this one before the agent reported
    Superseded,
    /// The agent disconnected before reporting
    Disconnected,
}

/// One-shot acknowledgment signal attached to a config push.
///
/// Firing consumes the signal, so a push is acknowledged at most once.
#[derive(Debug)]
pub struct AckSignal(oneshot::Sender<AckEvent>);

impl AckSignal {
    pub fn channel() -> (Self, oneshot::Receiver<AckEvent>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub(crate) fn fire(self, event: AckEvent) {
        // The waiter may have given up already
        let _ = self.0.send(event);
    }
}

/// Status fields accumulated from the agent's reports
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStatus {
    pub sequence_num: u64,
    pub description: Option<AgentDescription>,
    pub capabilities: u64,
    pub health: Option<ComponentHealth>,
    pub remote_config_status: Option<RemoteConfigStatus>,
}

/// Read-only copy of a session, safe to keep after the registry lock is released
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub connection_id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    /// Identifier the agent reports for itself; informational only
    pub instance_uid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: AgentStatus,
    pub assignment: Assignment,
    pub effective_config: Option<ConfigValue>,
    /// Hex digest of the last pushed config
    pub remote_config_hash: Option<String>,
    #[serde(skip)]
    pub remote_config: Option<AgentRemoteConfig>,
    pub awaiting_ack: bool,
}

/// Live state of one connected agent
#[derive(Debug)]
pub struct AgentSession {
    id: AgentId,
    connection: ConnectionRef,
    started_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_status: AgentStatus,
    /// Last config pushed by the control plane
    remote_config: Option<AgentRemoteConfig>,
    /// Last config the agent reported as running
    effective_config: Option<ConfigValue>,
    pub(crate) assignment: Assignment,
    pending_ack: Option<AckSignal>,
    reported_instance_uid: Option<String>,
    last_sequence_num: Option<u64>,
}

impl AgentSession {
    pub fn new(id: AgentId, connection: ConnectionRef) -> Self {
        let now = Utc::now();
        Self {
            id,
            connection,
            started_at: now,
            last_seen: now,
            last_status: AgentStatus::default(),
            remote_config: None,
            effective_config: None,
            assignment: Assignment::default(),
            pending_ack: None,
            reported_instance_uid: None,
            last_sequence_num: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn effective_config(&self) -> Option<&ConfigValue> {
        self.effective_config.as_ref()
    }

    pub fn remote_config(&self) -> Option<&AgentRemoteConfig> {
        self.remote_config.as_ref()
    }

    pub fn has_pending_ack(&self) -> bool {
        self.pending_ack.is_some()
    }

    /// Apply an inbound status report and build the reply.
    ///
    /// Absent fields leave the previous values in place. A malformed
    /// effective config is logged and ignored. A pending ack fires with the
    /// report's remote config status, unless that status names a config other
    /// than the one last pushed.
    pub fn update_status(&mut self, report: AgentToServer) -> ServerToAgent {
        self.last_seen = Utc::now();

        if !report.instance_uid.is_empty()
            && self.reported_instance_uid.as_deref() != Some(report.instance_uid.as_str())
        {
            debug!(agent_id = %self.id, instance_uid = %report.instance_uid, "Agent reported instance uid");
            self.reported_instance_uid = Some(report.instance_uid.clone());
        }

        let sequence_gap = self
            .last_sequence_num
            .is_some_and(|previous| report.sequence_num != previous.wrapping_add(1));
        if sequence_gap {
            debug!(
                agent_id = %self.id,
                expected = self.last_sequence_num.map(|n| n.wrapping_add(1)),
                received = report.sequence_num,
                "Status sequence gap, requesting full state"
            );
        }
        self.last_sequence_num = Some(report.sequence_num);
        self.last_status.sequence_num = report.sequence_num;

        if let Some(description) = report.agent_description {
            self.last_status.description = Some(description);
        }
        if report.capabilities != 0 {
            self.last_status.capabilities = report.capabilities;
        }
        if let Some(health) = report.health {
            self.last_status.health = Some(health);
        }

        if let Some(effective) = report.effective_config {
            match effective.config_map.primary_document() {
                Ok(Some(document)) => {
                    trace!(agent_id = %self.id, "Effective config updated");
                    self.effective_config = Some(document);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(agent_id = %self.id, error = %e, "Ignoring malformed effective config");
                }
            }
        }

        if let Some(status) = &report.remote_config_status {
            self.last_status.remote_config_status = Some(status.clone());
        }

        // A status naming another hash predates the push; keep waiting
        let reports_pushed_config = match (&report.remote_config_status, &self.remote_config) {
            (Some(status), Some(remote)) => status.last_remote_config_hash == remote.config_hash,
            _ => true,
        };
        if reports_pushed_config {
            if let Some(ack) = self.pending_ack.take() {
                debug!(agent_id = %self.id, "Resolving pending config acknowledgment");
                ack.fire(AckEvent::StatusReported(report.remote_config_status));
            }
        } else if self.pending_ack.is_some() {
            debug!(agent_id = %self.id, "Status names a previous config, still awaiting acknowledgment");
        }

        if report.agent_disconnect {
            debug!(agent_id = %self.id, "Agent announced disconnect");
        }

        let mut response = self.outbound_message();
        if sequence_gap || self.last_status.description.is_none() {
            response.flags |= server_flags::REPORT_FULL_STATE;
        }

        // Re-offer the pushed config until the agent reports that exact hash
        if let Some(remote) = &self.remote_config {
            let reported_hash = self
                .last_status
                .remote_config_status
                .as_ref()
                .map(|status| status.last_remote_config_hash.as_slice());
            if reported_hash != Some(remote.config_hash.as_slice()) {
                response.remote_config = Some(remote.clone());
            }
        }

        response
    }

    /// Record a pushed config and its ack signal, returning the message to send.
    ///
    /// A previous unfired signal resolves as [`AckEvent::Superseded`].
    pub fn push_config(&mut self, config: AgentRemoteConfig, ack: Option<AckSignal>) -> ServerToAgent {
        if let Some(previous) = self.pending_ack.take() {
            previous.fire(AckEvent::Superseded);
        }
        self.pending_ack = ack;

        let mut message = self.outbound_message();
        message.remote_config = Some(config.clone());
        self.remote_config = Some(config);
        message
    }

    /// Message carrying a connection settings offer. No session state changes.
    pub fn offer_connection_settings(&self, offers: ConnectionSettingsOffers) -> ServerToAgent {
        debug!(agent_id = %self.id, "Offering connection settings");
        let mut message = self.outbound_message();
        message.connection_settings = Some(offers);
        message
    }

    pub fn clone_readonly(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            connection_id: self.connection.connection_id(),
            remote_addr: self.connection.remote_address(),
            instance_uid: self.reported_instance_uid.clone(),
            started_at: self.started_at,
            last_seen: self.last_seen,
            status: self.last_status.clone(),
            assignment: self.assignment.clone(),
            effective_config: self.effective_config.clone(),
            remote_config_hash: self.remote_config.as_ref().map(AgentRemoteConfig::hash_hex),
            remote_config: self.remote_config.clone(),
            awaiting_ack: self.pending_ack.is_some(),
        }
    }

    /// Detach the pending ack, if any, so it can be resolved outside the lock
    pub(crate) fn take_pending_ack(&mut self) -> Option<AckSignal> {
        self.pending_ack.take()
    }

    fn outbound_message(&self) -> ServerToAgent {
        let instance_uid = self
            .reported_instance_uid
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        ServerToAgent::for_instance(instance_uid)
    }
}
