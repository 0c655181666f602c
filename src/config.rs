//! Bridge configuration
//!
//! Loaded once at startup from a TOML file. Every field has a default so a missing
//! file or a partial file still yields a usable configuration.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/mqtt-ws-bridge";
const CONFIG_FILE: &str = "config.toml";

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "MQTT_WS_BRIDGE_CONFIG";

/// Environment variable overriding the listen address
pub const LISTEN_ADDR_ENV: &str = "GVM_ADDR";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the HTTP/WebSocket server binds to
    pub listen_addr: String,
    /// Directory served under `/static`
    pub static_dir: PathBuf,
    pub broker: BrokerSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9090".to_string(),
            static_dir: PathBuf::from("./static"),
            broker: BrokerSettings::default(),
        }
    }
}

/// Tuning for the single broker connection
///
/// Durations are stored in plain integers so the TOML stays readable.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    /// Upper bound for the CONNECT/CONNACK handshake
    pub connect_timeout_ms: u64,
    /// How long the network task may drain after DISCONNECT
    pub disconnect_linger_ms: u64,
    /// Upper bound for a SUBACK
    pub ack_timeout_ms: u64,
    pub keep_alive_secs: u64,
    /// Capacity of the client library's request channel
    pub request_capacity: usize,
    /// Prepended to the time-derived client identifier
    pub client_id_prefix: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            disconnect_linger_ms: 2,
            ack_timeout_ms: 3000,
            keep_alive_secs: 5,
            request_capacity: 100,
            client_id_prefix: "mqtt-ws-bridge-".to_string(),
        }
    }
}

impl BrokerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_linger(&self) -> Duration {
        Duration::from_millis(self.disconnect_linger_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl BridgeConfig {
    /// Resolves the config path, reads it if present and applies env overrides
    pub async fn load() -> Result<Self> {
        let path = config_path();
        let mut config = Self::load_from(&path).await?;
        if let Ok(addr) = std::env::var(LISTEN_ADDR_ENV) {
            config.apply_listen_override(&addr);
        }
        Ok(config)
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Accepts a bare `:9090` as well as a full `host:port`
    pub fn apply_listen_override(&mut self, addr: &str) {
        let addr = addr.trim();
        if addr.is_empty() {
            return;
        }
        self.listen_addr = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };
        debug!("Listen address overridden to {}", self.listen_addr);
    }
}

fn config_path() -> PathBuf {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(explicit);
    }
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
