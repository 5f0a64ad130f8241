use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the peer's base TCP port.
pub const ENV_TCP_PORT: &str = "EDITOR_TCP_PORT";
/// Environment variable that enables development mode when set to `development`.
pub const ENV_MODE: &str = "EDITOR_BRIDGE_ENV";
/// Environment variable naming the MCP client when the handshake does not.
pub const ENV_CLIENT_NAME: &str = "MCP_CLIENT_NAME";
/// Environment variable redirecting logs to a file.
pub const ENV_LOG_FILE: &str = "EDITOR_BRIDGE_LOG_FILE";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7400;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Verbose diagnostics and development-only capabilities.
    #[serde(default)]
    pub development: bool,

    /// Used when the MCP client does not name itself.
    #[serde(default)]
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Base port; discovery probes offsets from here.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Offsets from the base port, probed in order.
    #[serde(default = "default_port_offsets")]
    pub port_offsets: Vec<i32>,
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_port_offsets() -> Vec<i32> {
    vec![0, 100, 200, 300, 400, -100]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            port_offsets: default_port_offsets(),
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Ports to probe for a given base port, skipping any that fall outside
    /// the valid range.
    pub fn candidate_ports(&self, base_port: u16) -> Vec<u16> {
        self.port_offsets
            .iter()
            .filter_map(|offset| u16::try_from(i32::from(base_port) + offset).ok())
            .filter(|port| *port != 0)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Budget for a capability call. Longer than the peer's own operation
    /// timeout so the peer's error reaches the caller first.
    #[serde(default = "default_network_ms")]
    pub network_ms: u64,

    /// Budget for the liveness ping.
    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,

    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// How long a synchronous `initialize` waits for the peer.
    #[serde(default = "default_initialize_wait_ms")]
    pub initialize_wait_ms: u64,
}

fn default_network_ms() -> u64 {
    120_000
}

fn default_health_check_ms() -> u64 {
    3_000
}

fn default_connect_ms() -> u64 {
    3_000
}

fn default_initialize_wait_ms() -> u64 {
    10_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            network_ms: default_network_ms(),
            health_check_ms: default_health_check_ms(),
            connect_ms: default_connect_ms(),
            initialize_wait_ms: default_initialize_wait_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn network(&self) -> Duration {
        Duration::from_millis(self.network_ms)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn initialize_wait(&self) -> Duration {
        Duration::from_millis(self.initialize_wait_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Whether an `EDITOR_BRIDGE_ENV` value selects development mode.
    pub fn is_development_mode(value: &str) -> bool {
        value.eq_ignore_ascii_case("development")
    }
}
