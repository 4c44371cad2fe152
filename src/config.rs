//! Gateway configuration
//!
//! Loaded from a JSON file; every field has a default so partial files are
//! fine. Durations are stored as milliseconds.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Default CoAP port (RFC 7252 §6.1)
pub const COAP_PORT: u16 = 5683;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub storage: StorageConfig,
}

/// Sensor endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address the CoAP server binds
    pub bind: SocketAddr,
    /// Interval between simulated sensor updates
    pub update_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, COAP_PORT)),
            update_interval_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

/// Polling client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local UDP address for outgoing requests
    pub bind: SocketAddr,
    /// Overall deadline for one exchange
    pub timeout_ms: u64,
    /// Initial retransmission interval, doubled on each retry
    pub ack_timeout_ms: u64,
    /// Retransmissions within the deadline (0 sends once)
    pub max_retransmit: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            timeout_ms: 5000,
            ack_timeout_ms: 2000,
            max_retransmit: 0,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Optional JSON files backing the gateway stores; in-memory when unset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub config_log: Option<PathBuf>,
    pub readings: Option<PathBuf>,
}

impl GatewayConfig {
    /// Read and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config from `path` when given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.update_interval_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "server.update_interval_ms must be positive".into(),
            ));
        }
        self.client.validate()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "client.timeout_ms must be positive".into(),
            ));
        }
        if self.max_retransmit > 0 && self.ack_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "client.ack_timeout_ms must be positive when retransmitting".into(),
            ));
        }
        Ok(())
    }
}
