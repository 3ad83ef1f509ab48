//! Node configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `ZEROLINK__SECTION__KEY` environment variables. Each component receives
//! its own section at construction.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::framing::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub connectivity: ConnectivityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name announced to other peers; defaults to the system host name.
    pub name: Option<String>,
    /// Where the persistent peer identity lives.
    pub data_dir: PathBuf,
    /// Relay inbound RoutedSessionData for other peers.
    pub coordinator: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from(".zerolink"),
            coordinator: false,
        }
    }
}

impl NodeConfig {
    pub fn host_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Unknown Device".to_string())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub port: u16,
    pub interval_ms: u64,
    /// Peers silent for this long are marked offline.
    pub stale_after_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(239, 255, 77, 77),
            port: 37020,
            interval_ms: 3000,
            stale_after_ms: 15000,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub bind: SocketAddr,
    pub lifetime_secs: u64,
    pub max_frame_len: usize,
    pub handshake_timeout_ms: u64,
    pub max_connections: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 37021)),
            lifetime_secs: 30 * 60,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            handshake_timeout_ms: 10_000,
            max_connections: 1024,
        }
    }
}

impl SessionConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Coordinator address; without one the node stays in Direct mode.
    pub relay: Option<SocketAddr>,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            relay: None,
            poll_interval_ms: 3000,
            probe_timeout_ms: 1000,
        }
    }
}

impl ConnectivityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Also write daily-rolling log files here.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("ZEROLINK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
