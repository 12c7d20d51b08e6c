//! Configuration for the signaling server
//!
//! Configuration can be loaded from a TOML file; every field has a default so
//! an empty file (or no file at all) yields a working server.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::relay::RelayMode;
use crate::session::IcePolicy;
use crate::{Error, Result};

/// Main configuration for the signaling server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Delivery configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Peer identity configuration
    #[serde(default)]
    pub peers: PeersConfig,

    /// Session negotiation configuration
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrently registered peers
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_peers() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_peers: default_max_peers(),
        }
    }
}

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Broadcast every frame verbatim, or route addressed envelopes
    #[serde(default)]
    pub mode: RelayMode,

    /// Per-connection outbound queue depth
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// How long a single outbound send may wait for queue space
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_outbound_queue() -> usize {
    128
}

fn default_send_timeout_ms() -> u64 {
    5000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            outbound_queue: default_outbound_queue(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl RelayConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// How fresh peer ids are minted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerIdFormat {
    /// "1", "2", "3", ...
    #[default]
    Sequential,
    /// Random v4 UUIDs
    Uuid,
}

/// Peer identity configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeersConfig {
    #[serde(default)]
    pub id_format: PeerIdFormat,
}

/// Session negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Seconds a session may stay in Requested/Offered/Answered (0 disables)
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Interval of the expiry sweep in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Seconds an Ended/Errored session stays queryable
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_secs: u64,

    /// ICE candidate forwarding policy
    #[serde(default)]
    pub ice_policy: IcePolicy,
}

fn default_negotiation_timeout() -> u64 {
    30
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_terminal_retention() -> u64 {
    60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: default_negotiation_timeout(),
            sweep_interval_ms: default_sweep_interval_ms(),
            terminal_retention_secs: default_terminal_retention(),
            ice_policy: IcePolicy::default(),
        }
    }
}

impl SessionsConfig {
    /// `None` when the timeout is disabled
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.negotiation_timeout_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}

impl SignalingConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SignalingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Address the listener binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(Error::InvalidConfig("server.host must not be empty".to_string()));
        }

        if self.server.max_peers == 0 {
            return Err(Error::InvalidConfig(
                "server.max_peers must be at least 1".to_string(),
            ));
        }

        if self.relay.outbound_queue == 0 {
            return Err(Error::InvalidConfig(
                "relay.outbound_queue must be at least 1".to_string(),
            ));
        }

        if self.relay.send_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "relay.send_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.sessions.sweep_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "sessions.sweep_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
