//! Configuration management.
//!
//! flowcast configuration can come from:
//! - Environment variables (FLOWCAST_*)
//! - Config file (~/.config/flowcast/config.toml)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::storage::{DispatchSettings, RetryPolicy};

/// flowcast configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Flow engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Dispatch defaults for automations that do not set their own
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Schedule runner configuration
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Poll interval for the schedule runner (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Listen address for the Prometheus scrape endpoint; unset disables
    /// the HTTP exporter
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            metrics_listen: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Effective database path, defaulting under the platform data dir.
    pub fn effective_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("flowcast.db"))
    }
}

/// Flow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hours an awaiting-input conversation survives without a reply
    /// before purge; 0 keeps state forever
    #[serde(default = "default_state_ttl_hours")]
    pub state_ttl_hours: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_ttl_hours: default_state_ttl_hours(),
        }
    }
}

fn default_state_ttl_hours() -> u64 {
    72
}

impl EngineConfig {
    pub fn state_ttl(&self) -> Option<chrono::Duration> {
        (self.state_ttl_hours > 0).then(|| chrono::Duration::hours(self.state_ttl_hours as i64))
    }
}

/// Default dispatch settings applied to newly created automations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl DispatchConfig {
    /// Materialize into concrete settings, model defaults filling the gaps.
    pub fn settings(&self) -> DispatchSettings {
        let base = DispatchSettings::default();
        DispatchSettings {
            rate_limit_per_hour: self.rate_limit_per_hour.unwrap_or(base.rate_limit_per_hour),
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            retry: self.retry.unwrap_or(base.retry),
        }
    }
}

/// Schedule runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Holiday dates (YYYY-MM-DD) consulted by schedules that set
    /// `skip_holidays`
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Primary config file: ~/.config/flowcast/config.toml
        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("flowcast"))
            .unwrap_or_else(|| PathBuf::from(".flowcast"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("flowcast"))
            .unwrap_or_else(|| PathBuf::from(".flowcast"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("FLOWCAST_POLL_INTERVAL_MS") {
            if let Ok(parsed) = interval.parse::<u64>() {
                self.server.poll_interval_ms = parsed;
            }
        }
        if let Ok(listen) = std::env::var("FLOWCAST_METRICS_LISTEN") {
            if let Ok(parsed) = listen.parse::<SocketAddr>() {
                self.server.metrics_listen = Some(parsed);
            }
        }
        if let Ok(path) = std::env::var("FLOWCAST_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(ttl) = std::env::var("FLOWCAST_STATE_TTL_HOURS") {
            if let Ok(parsed) = ttl.parse::<u64>() {
                self.engine.state_ttl_hours = parsed;
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(dispatch) = partial.dispatch {
            self.dispatch = dispatch;
        }
        if let Some(schedule) = partial.schedule {
            self.schedule = schedule;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    engine: Option<EngineConfig>,
    dispatch: Option<DispatchConfig>,
    schedule: Option<ScheduleConfig>,
}
