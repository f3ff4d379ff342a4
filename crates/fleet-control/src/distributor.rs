//! Partial config updates with optional confirmation
//!
//! A change targets one section of the collector config (by default
//! `processors.tail_sampling`). The distributor merges it into the agent's
//! current document, pushes the result and, if asked, waits for the agent's
//! next status report.

use fleet_proto::{AgentConfigMap, AgentRemoteConfig, ConfigValue, RemoteConfigStatuses};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::registry::{AgentRegistry, Delivery};
use crate::session::{AckEvent, AckSignal, AgentSnapshot};
use crate::AgentId;

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Path of the section that changes are merged into
    pub section: Vec<String>,
    /// Wait used when the caller does not pass a timeout
    pub default_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            section: vec!["processors".to_string(), "tail_sampling".to_string()],
            default_timeout: Duration::from_secs(5),
        }
    }
}

impl DistributorConfig {
    /// Set the section from a dotted path, e.g. `processors.tail_sampling`
    pub fn with_section(mut self, dotted: &str) -> Self {
        self.section = dotted
            .split('.')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Why a waited-for push was not confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unconfirmed {
    TimedOut,
    /// A newer push replaced this one
    Superseded,
    Disconnected,
    Cancelled,
    /// The agent reported on a config other than the pushed one
    Stale,
}

/// Result of a delivered push. None of these are errors: the config reached
/// the agent's connection in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Delivered, no confirmation requested
    Sent,
    /// The agent reported back
    Confirmed,
    /// The agent reported it failed to apply this config
    Rejected { message: String },
    Unconfirmed(Unconfirmed),
}

impl PushOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, PushOutcome::Confirmed)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigDistributor {
    registry: AgentRegistry,
    config: DistributorConfig,
}

impl ConfigDistributor {
    pub fn new(registry: AgentRegistry, config: DistributorConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// The document a change is merged into: the agent's effective config,
    /// else the last pushed config, else an empty document.
    pub fn merge_base(snapshot: &AgentSnapshot) -> ConfigValue {
        if let Some(effective) = &snapshot.effective_config {
            return effective.clone();
        }

        let pushed = snapshot
            .remote_config
            .as_ref()
            .map(|remote| remote.config.primary_document());
        match pushed {
            Some(Ok(Some(document))) => document,
            Some(Err(e)) => {
                warn!(agent_id = %snapshot.id, error = %e, "Last pushed config unreadable, merging into empty document");
                ConfigValue::empty_map()
            }
            _ => ConfigValue::empty_map(),
        }
    }

    /// Full document that `change` would produce for agent `id`
    pub fn merged_document(&self, id: AgentId, change: &ConfigValue) -> ControlResult<ConfigValue> {
        let snapshot = self
            .registry
            .find(id)
            .ok_or(ControlError::AgentNotFound(id))?;

        let mut document = Self::merge_base(&snapshot);
        document
            .section_mut_or_insert(&self.config.section)
            .merge(change);
        Ok(document)
    }

    /// Current value of the configured section in the agent's effective
    /// config. `Ok(None)` means the agent has not reported that section yet.
    pub fn get_config(&self, id: AgentId) -> ControlResult<Option<ConfigValue>> {
        let snapshot = self
            .registry
            .find(id)
            .ok_or(ControlError::AgentNotFound(id))?;

        Ok(snapshot
            .effective_config
            .as_ref()
            .and_then(|document| document.section(&self.config.section))
            .filter(|section| !section.is_null())
            .cloned())
    }

    pub async fn update_config(
        &self,
        id: AgentId,
        change: &ConfigValue,
        wait: bool,
        timeout: Option<Duration>,
    ) -> ControlResult<PushOutcome> {
        self.update_config_with_cancel(id, change, wait, timeout, &CancellationToken::new())
            .await
    }

    /// Merge, push and optionally wait for confirmation.
    ///
    /// Cancelling `cancel` abandons the wait only; the config has already been
    /// sent by then.
    pub async fn update_config_with_cancel(
        &self,
        id: AgentId,
        change: &ConfigValue,
        wait: bool,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ControlResult<PushOutcome> {
        let document = self.merged_document(id, change)?;
        let remote = AgentRemoteConfig::new(AgentConfigMap::from_document(&document)?);
        let hash = remote.config_hash.clone();

        let (signal, ack) = if wait {
            let (signal, ack) = AckSignal::channel();
            (Some(signal), Some(ack))
        } else {
            (None, None)
        };

        match self.registry.push_config(id, remote, signal).await? {
            Delivery::Sent => {}
            Delivery::UnknownAgent => return Err(ControlError::AgentNotFound(id)),
        }

        let Some(ack) = ack else {
            return Ok(PushOutcome::Sent);
        };

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        debug!(agent_id = %id, ?timeout, "Waiting for config acknowledgment");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => PushOutcome::Unconfirmed(Unconfirmed::Cancelled),
            result = tokio::time::timeout(timeout, ack) => match result {
                Err(_) => PushOutcome::Unconfirmed(Unconfirmed::TimedOut),
                // Signal dropped without firing: the session went away
                Ok(Err(_)) => PushOutcome::Unconfirmed(Unconfirmed::Disconnected),
                Ok(Ok(event)) => Self::outcome_for(event, &hash),
            },
        };

        match &outcome {
            PushOutcome::Confirmed => info!(agent_id = %id, "Config push confirmed"),
            PushOutcome::Rejected { message } => {
                warn!(agent_id = %id, error = %message, "Agent failed to apply pushed config")
            }
            other => info!(agent_id = %id, outcome = ?other, "Config push unconfirmed"),
        }
        Ok(outcome)
    }

    fn outcome_for(event: AckEvent, pushed_hash: &[u8]) -> PushOutcome {
        match event {
            AckEvent::StatusReported(Some(status))
                if status.status == RemoteConfigStatuses::Failed
                    && status.last_remote_config_hash == pushed_hash =>
            {
                PushOutcome::Rejected {
                    message: status.error_message,
                }
            }
            AckEvent::StatusReported(Some(status))
                if status.last_remote_config_hash != pushed_hash =>
            {
                PushOutcome::Unconfirmed(Unconfirmed::Stale)
            }
            AckEvent::StatusReported(_) => PushOutcome::Confirmed,
            AckEvent::Superseded => PushOutcome::Unconfirmed(Unconfirmed::Superseded),
            AckEvent::Disconnected => PushOutcome::Unconfirmed(Unconfirmed::Disconnected),
        }
    }
}
