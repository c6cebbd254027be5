//! Simulator configuration
//!
//! Loads listener settings and the reported device status from a TOML file.
//! Every key is optional; missing keys keep the values of the real device.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::server::{CannedMessages, ServerConfig};

/// Default bind address: all interfaces
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Port the device firmware listens on
pub const DEFAULT_PORT: u16 = 81;
/// Path the device firmware serves its socket on
pub const DEFAULT_PATH: &str = "/ws";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// WebSocket endpoint path
    pub path: String,
    /// Limit on concurrent connections
    pub max_connections: Option<usize>,
    /// Seconds of client silence before the connection is closed
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            max_connections: None,
            idle_timeout_secs: None,
        }
    }
}

/// Command line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub max_connections: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
}

/// Simulator configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Listener settings
    pub server: ListenConfig,
    /// Status payloads reported to clients
    pub messages: CannedMessages,
}

impl SimulatorConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SimulatorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use the device defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Replace file values with any command line values that were given
    pub fn apply(mut self, overrides: Overrides) -> Self {
        let server = &mut self.server;
        if let Some(bind) = overrides.bind {
            server.bind = bind;
        }
        if let Some(port) = overrides.port {
            server.port = port;
        }
        if let Some(path) = overrides.path {
            server.path = path;
        }
        if overrides.max_connections.is_some() {
            server.max_connections = overrides.max_connections;
        }
        if overrides.idle_timeout_secs.is_some() {
            server.idle_timeout_secs = overrides.idle_timeout_secs;
        }
        self
    }

    /// Check values the listener cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if !server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "path must start with '/', got {:?}",
                server.path
            )));
        }
        if server.max_connections == Some(0) {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if server.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "idle_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the server configuration
    pub fn server_config(&self) -> ServerConfig {
        let server = &self.server;
        ServerConfig::new(server.bind.clone(), server.port)
            .with_path(server.path.clone())
            .with_max_connections(server.max_connections)
            .with_idle_timeout(server.idle_timeout_secs.map(Duration::from_secs))
            .with_messages(self.messages.clone())
    }
}
