use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const ENV_SERVER_URL: &str = "DISPATCH_SERVER_URL";
pub const ENV_RECONNECT_BASE_MS: &str = "DISPATCH_RECONNECT_BASE_MS";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "DISPATCH_MAX_RECONNECT_ATTEMPTS";
pub const ENV_SIMULATION_SEED: &str = "DISPATCH_SIMULATION_SEED";
pub const ENV_NOTIFICATION_CAPACITY: &str = "DISPATCH_NOTIFICATION_CAPACITY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub keepalive: KeepaliveSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket URL (e.g. ws://localhost:8001/api/ws). Unset means simulation mode.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect; doubles on every further attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveSettings {
    /// Seconds between pings while open; 0 disables keep-alive
    #[serde(default = "default_keepalive_secs")]
    pub interval_secs: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_keepalive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Fixed seed for a reproducible stream
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_reference_lat")]
    pub reference_lat: f64,
    #[serde(default = "default_reference_lng")]
    pub reference_lng: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            handshake_delay_ms: default_handshake_delay_ms(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            seed: None,
            reference_lat: default_reference_lat(),
            reference_lng: default_reference_lng(),
        }
    }
}

impl SimulationSettings {
    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_handshake_delay_ms() -> u64 {
    1000
}

fn default_min_interval_ms() -> u64 {
    3000
}

fn default_max_interval_ms() -> u64 {
    8000
}

fn default_reference_lat() -> f64 {
    40.7589
}

fn default_reference_lng() -> f64 {
    -73.9851
}

fn default_capacity() -> usize {
    20
}

impl ClientConfig {
    /// Load config from file and environment variables.
    /// Environment variables take precedence over file config.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default = Self::config_path();
                if default.exists() {
                    Self::load_from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".dispatch-client/config.toml")
    }

    /// Override settings from environment-style lookups.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVER_URL) {
            let url = url.trim().to_string();
            self.server.url = (!url.is_empty()).then_some(url);
        }
        if let Some(value) = lookup(ENV_RECONNECT_BASE_MS) {
            self.reconnect.base_delay_ms = parse_var(ENV_RECONNECT_BASE_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_RECONNECT_ATTEMPTS) {
            self.reconnect.max_attempts = parse_var(ENV_MAX_RECONNECT_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_SIMULATION_SEED) {
            self.simulation.seed = Some(parse_var(ENV_SIMULATION_SEED, &value)?);
        }
        if let Some(value) = lookup(ENV_NOTIFICATION_CAPACITY) {
            self.notifications.capacity = parse_var(ENV_NOTIFICATION_CAPACITY, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.simulation.min_interval_ms > self.simulation.max_interval_ms {
            anyhow::bail!(
                "simulation.min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.simulation.min_interval_ms,
                self.simulation.max_interval_ms
            );
        }
        if self.notifications.capacity == 0 {
            anyhow::bail!("notifications.capacity must be at least 1");
        }
        Ok(())
    }

    /// Server URL, if a live peer is configured.
    pub fn server_url(&self) -> Option<&str> {
        self.server.url.as_deref()
    }

    pub fn is_simulated(&self) -> bool {
        self.server.url.is_none()
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.base_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive.interval_secs > 0).then(|| Duration::from_secs(self.keepalive.interval_secs))
    }
}

fn parse_var<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {}: {:?}", key, value))
}
