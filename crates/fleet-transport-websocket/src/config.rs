//! WebSocket transport configuration

use fleet_transport::{TransportError, TransportResult};
use std::time::Duration;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Upgrade path (e.g., "/v1/opamp")
    pub path: String,

    /// Keep-alive interval (ping frames)
    pub keep_alive_interval: Duration,

    /// Connection is closed after this long without any inbound frame
    pub idle_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,

    /// Depth of the per-connection outbound queue
    pub outbound_queue: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/v1/opamp".to_string(),
            keep_alive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_message_size: fleet_proto::MAX_FRAME_SIZE,
            outbound_queue: 64,
        }
    }
}

impl WebSocketConfig {
    /// Set WebSocket path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_outbound_queue(mut self, depth: usize) -> Self {
        self.outbound_queue = depth;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(format!(
                "WebSocket path must start with '/': {}",
                self.path
            )));
        }
        if self.keep_alive_interval.is_zero() || self.idle_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval and idle timeout must be non-zero".to_string(),
            ));
        }
        if self.keep_alive_interval >= self.idle_timeout {
            return Err(TransportError::ConfigurationError(format!(
                "Keep-alive interval ({:?}) must be shorter than idle timeout ({:?})",
                self.keep_alive_interval, self.idle_timeout
            )));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Max message size must be non-zero".to_string(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(TransportError::ConfigurationError(
                "Outbound queue depth must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WebSocketConfig::default();
        assert_eq!(config.path, "/v1/opamp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = WebSocketConfig::default()
            .with_path("/agents")
            .with_keep_alive(Duration::from_secs(5))
            .with_idle_timeout(Duration::from_secs(20))
            .with_outbound_queue(8);

        assert_eq!(config.path, "/agents");
        assert_eq!(config.keep_alive_interval, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(20));
        assert_eq!(config.outbound_queue, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(WebSocketConfig::default().with_path("agents").validate().is_err());
        assert!(WebSocketConfig::default()
            .with_keep_alive(Duration::from_secs(120))
            .validate()
            .is_err());
        assert!(WebSocketConfig::default()
            .with_outbound_queue(0)
            .validate()
            .is_err());
        assert!(WebSocketConfig::default()
            .with_max_message_size(0)
            .validate()
            .is_err());
    }
}
