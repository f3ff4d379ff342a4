//! Protocol message types

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::{ConfigValue, DocumentError, CONTENT_TYPE_YAML};

/// Status report sent by an agent.
///
/// Every payload field is optional: an absent field means "unchanged since the
/// previous report".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentToServer {
    /// Instance identifier chosen by the agent itself
    pub instance_uid: String,
    /// Incremented by the agent for every report
    pub sequence_num: u64,
    pub agent_description: Option<AgentDescription>,
    /// Bitmask of `agent_capabilities`
    pub capabilities: u64,
    pub health: Option<ComponentHealth>,
    pub effective_config: Option<EffectiveConfig>,
    pub remote_config_status: Option<RemoteConfigStatus>,
    /// Set by the agent right before it closes the connection on purpose
    pub agent_disconnect: bool,
    pub flags: u64,
}

/// Message sent by the control plane to an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerToAgent {
    pub instance_uid: String,
    pub error_response: Option<ServerErrorResponse>,
    pub remote_config: Option<AgentRemoteConfig>,
    pub connection_settings: Option<ConnectionSettingsOffers>,
    /// Bitmask of `server_flags`
    pub flags: u64,
    pub capabilities: u64,
}

impl ServerToAgent {
    pub fn for_instance(instance_uid: impl Into<String>) -> Self {
        Self {
            instance_uid: instance_uid.into(),
            capabilities: server_capabilities::ACCEPTS_STATUS
                | server_capabilities::OFFERS_REMOTE_CONFIG
                | server_capabilities::OFFERS_CONNECTION_SETTINGS,
            ..Default::default()
        }
    }

    pub fn requests_full_state(&self) -> bool {
        self.flags & server_flags::REPORT_FULL_STATE != 0
    }
}

pub mod server_flags {
    /// Ask the agent to resend every status field on its next report
    pub const REPORT_FULL_STATE: u64 = 0x1;
}

pub mod server_capabilities {
    pub const ACCEPTS_STATUS: u64 = 0x1;
    pub const OFFERS_REMOTE_CONFIG: u64 = 0x2;
    pub const OFFERS_CONNECTION_SETTINGS: u64 = 0x20;
}

pub mod agent_capabilities {
    pub const REPORTS_STATUS: u64 = 0x1;
    pub const ACCEPTS_REMOTE_CONFIG: u64 = 0x2;
    pub const REPORTS_EFFECTIVE_CONFIG: u64 = 0x4;
    pub const REPORTS_HEALTH: u64 = 0x800;
    pub const REPORTS_REMOTE_CONFIG: u64 = 0x1000;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Agent self-description (service name, version, host attributes)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentDescription {
    pub identifying_attributes: Vec<KeyValue>,
    pub non_identifying_attributes: Vec<KeyValue>,
}

impl AgentDescription {
    /// Look up an attribute, identifying attributes first
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.identifying_attributes
            .iter()
            .chain(self.non_identifying_attributes.iter())
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub start_time_unix_nano: u64,
    pub last_error: String,
    pub status: String,
    pub status_time_unix_nano: u64,
}

/// A single configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfigFile {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Named configuration files. The empty name denotes the agent's main config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfigMap {
    pub config_map: BTreeMap<String, AgentConfigFile>,
}

impl AgentConfigMap {
    /// Config map holding one unnamed file
    pub fn single(body: Vec<u8>, content_type: impl Into<String>) -> Self {
        let mut config_map = BTreeMap::new();
        config_map.insert(
            String::new(),
            AgentConfigFile {
                body,
                content_type: content_type.into(),
            },
        );
        Self { config_map }
    }

    /// Encode a document as the agent's main YAML config file
    pub fn from_document(document: &ConfigValue) -> Result<Self, DocumentError> {
        let body = document.to_yaml()?;
        Ok(Self::single(body.into_bytes(), CONTENT_TYPE_YAML))
    }

    /// The unnamed file if present, otherwise the first file by name
    pub fn primary_file(&self) -> Option<&AgentConfigFile> {
        self.config_map
            .get("")
            .or_else(|| self.config_map.values().next())
    }

    /// Decode the primary file. `Ok(None)` when the map holds no files.
    pub fn primary_document(&self) -> Result<Option<ConfigValue>, DocumentError> {
        self.primary_file()
            .map(|file| ConfigValue::decode(&file.body, &file.content_type))
            .transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.config_map.is_empty()
    }

    /// SHA-256 over names, content types and bodies in name order
    pub fn hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for (name, file) in &self.config_map {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(file.content_type.as_bytes());
            hasher.update([0u8]);
            hasher.update((file.body.len() as u64).to_be_bytes());
            hasher.update(&file.body);
        }
        hasher.finalize().to_vec()
    }
}

/// Configuration the agent reports as actually running
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EffectiveConfig {
    pub config_map: AgentConfigMap,
}

/// Configuration offered to the agent by the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentRemoteConfig {
    pub config: AgentConfigMap,
    pub config_hash: Vec<u8>,
}

impl AgentRemoteConfig {
    pub fn new(config: AgentConfigMap) -> Self {
        let config_hash = config.hash();
        Self {
            config,
            config_hash,
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.config_hash)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteConfigStatuses {
    #[default]
    Unset,
    Applied,
    Applying,
    Failed,
}

/// Agent's report on the last remote config it received
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfigStatus {
    pub last_remote_config_hash: Vec<u8>,
    pub status: RemoteConfigStatuses,
    pub error_message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerErrorKind {
    #[default]
    Unknown,
    BadRequest,
    Unavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerErrorResponse {
    pub kind: ServerErrorKind,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsCertificate {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    pub ca_public_key: Vec<u8>,
}

/// Settings for the agent's management connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpAmpConnectionSettings {
    pub destination_endpoint: String,
    pub headers: Vec<Header>,
    pub certificate: Option<TlsCertificate>,
    pub heartbeat_interval_seconds: u64,
}

/// Settings for one of the agent's own telemetry exporters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConnectionSettings {
    pub destination_endpoint: String,
    pub headers: Vec<Header>,
    pub certificate: Option<TlsCertificate>,
}

/// Connection parameter changes offered to an agent (e.g. rotated credentials)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettingsOffers {
    pub hash: Vec<u8>,
    pub opamp: Option<OpAmpConnectionSettings>,
    pub own_metrics: Option<TelemetryConnectionSettings>,
    pub own_traces: Option<TelemetryConnectionSettings>,
    pub own_logs: Option<TelemetryConnectionSettings>,
}
