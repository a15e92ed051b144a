//! Configuration loading and management

use crate::core::error::ConfigError;
use crate::protocol::frame::DEFAULT_MAX_PAYLOAD;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gateway configuration
///
/// Every field has a default, so a YAML file only needs the values it
/// changes:
///
/// ```yaml
/// host: 0.0.0.0
/// port: 9000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Interface to listen on
    pub host: String,

    /// TCP port; `0` picks a free port
    pub port: u16,

    /// Largest accepted inbound frame payload, in bytes
    pub max_frame_size: usize,

    /// How long a new connection may take to send its upgrade request
    pub handshake_timeout_ms: u64,

    /// Upper bound for the upgrade request headers, in bytes
    pub max_handshake_bytes: usize,

    /// Buffer size of the in-process notification bus
    pub event_bus_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_frame_size: DEFAULT_MAX_PAYLOAD,
            handshake_timeout_ms: 5_000,
            max_handshake_bytes: 8 * 1024,
            event_bus_capacity: 1024,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        let sizes = [
            ("max_frame_size", self.max_frame_size),
            ("max_handshake_bytes", self.max_handshake_bytes),
            ("event_bus_capacity", self.event_bus_capacity),
        ];
        if let Some((field, _)) = sizes.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::MustBePositive { field });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "handshake_timeout_ms",
            });
        }

        Ok(())
    }

    /// Apply `GATEWAY_HOST` / `GATEWAY_PORT` style overrides
    ///
    /// `lookup` is usually `std::env::var`; taking it as a parameter keeps
    /// tests away from process-global state.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("GATEWAY_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("GATEWAY_PORT") {
            self.port = port.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    /// `host:port` string for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
