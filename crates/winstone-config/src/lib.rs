//! Configuration management for Winstone
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Explicit `key=value` overrides (highest precedence)
//! 2. Environment variables (WINSTONE_* prefix)
//! 3. winstone.local.toml (gitignored, local overrides)
//! 4. winstone.toml (git-tracked, project config)
//! 5. ~/.config/winstone/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)
//!
//! Startup options are flat camelCase keys, as they appear on a Winstone
//! command line (`handlerCountMax = 50`). Web applications and JNDI
//! resources are arrays of tables.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Every flat key accepted from the environment or as an override.
pub const FLAT_KEYS: &[&str] = &[
    "hostname",
    "tempDir",
    "handlerCountStartup",
    "handlerCountMax",
    "handlerCountMaxIdle",
    "requestPoolMax",
    "responsePoolMax",
    "retryPeriodMs",
    "sweepPeriodMs",
    "useJNDI",
    "useCluster",
    "clusterClassName",
    "clusterNodes",
    "controlPort",
    "controlAddress",
    "heartbeatPeriodMs",
    "simulateModUniqueId",
    "useSavedSessions",
    "sessionTimeoutSecs",
    "sessionSweepPeriodMs",
];

/// Resolves `name` to its flat key, ignoring case, `_` and `-`.
///
/// `HANDLER_COUNT_MAX`, `handler-count-max` and `handlerCountMax` all name
/// `handlerCountMax`.
pub fn canonical_key(name: &str) -> Option<&'static str> {
    let wanted: String = name
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    FLAT_KEYS
        .iter()
        .copied()
        .find(|key| key.to_lowercase() == wanted)
}

/// Main Winstone configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WinstoneConfig {
    /// Name of the default host.
    pub hostname: String,
    /// Root of the per-webapp temp directories.
    pub temp_dir: PathBuf,

    pub handler_count_startup: u32,
    pub handler_count_max: u32,
    pub handler_count_max_idle: u32,
    pub request_pool_max: u32,
    pub response_pool_max: u32,
    /// Pause before the single retry when no handler thread is free.
    pub retry_period_ms: u64,
    /// Interval of the idle handler trim.
    pub sweep_period_ms: u64,

    #[serde(rename = "useJNDI")]
    pub use_jndi: bool,

    pub use_cluster: bool,
    pub cluster_class_name: String,
    /// Comma-separated seed peers, `ip:port`.
    pub cluster_nodes: String,
    /// Control port, `-1` disables it.
    pub control_port: i32,
    pub control_address: String,
    pub heartbeat_period_ms: u64,

    /// Give every request a `UNIQUE_ID` attribute.
    pub simulate_mod_unique_id: bool,
    pub use_saved_sessions: bool,
    pub session_timeout_secs: i32,
    pub session_sweep_period_ms: u64,

    pub webapps: Vec<WebAppSettings>,
    pub data_sources: Vec<DataSourceSettings>,
    pub mail_sessions: Vec<MailSessionSettings>,
    pub env_entries: Vec<EnvEntrySettings>,
}

impl Default for WinstoneConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            temp_dir: Paths::default_temp_dir(),
            handler_count_startup: 5,
            handler_count_max: 300,
            handler_count_max_idle: 50,
            request_pool_max: 300,
            response_pool_max: 300,
            retry_period_ms: 1000,
            sweep_period_ms: 2000,
            use_jndi: false,
            use_cluster: false,
            cluster_class_name: "simple".to_string(),
            cluster_nodes: String::new(),
            control_port: -1,
            control_address: "127.0.0.1".to_string(),
            heartbeat_period_ms: 5000,
            simulate_mod_unique_id: false,
            use_saved_sessions: false,
            session_timeout_secs: 1800,
            session_sweep_period_ms: 60_000,
            webapps: Vec::new(),
            data_sources: Vec::new(),
            mail_sessions: Vec::new(),
            env_entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebAppSettings {
    /// Context path: empty for the root application, else `/name`.
    pub prefix: String,
    pub distributable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataSourceSettings {
    /// Bound at `jdbc/<name>`.
    pub name: String,
    pub driver: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub max_connections: u32,
    pub max_idle: u32,
    pub starting_connections: u32,
    pub max_wait_ms: u64,
    pub validation_query: Option<String>,
    pub validation_timeout_ms: u64,
    pub keep_alive_query: Option<String>,
    /// `0` disables the keep-alive task.
    pub keep_alive_period_ms: u64,
    /// `0` disables the idle-connection drain.
    pub kill_inactive_period_ms: u64,
}

impl Default for DataSourceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: String::new(),
            url: String::new(),
            username: None,
            password: None,
            properties: BTreeMap::new(),
            max_connections: 20,
            max_idle: 10,
            starting_connections: 1,
            max_wait_ms: 10_000,
            validation_query: None,
            validation_timeout_ms: 3000,
            keep_alive_query: None,
            keep_alive_period_ms: 0,
            kill_inactive_period_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSessionSettings {
    pub name: String,
    pub properties: BTreeMap<String, String>,
}

/// A simple environment value, e.g. `java.lang.Integer` `"42"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvEntrySettings {
    pub name: String,
    pub class_name: String,
    pub value: String,
}

impl WinstoneConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// The control port, if enabled.
    pub fn control_port(&self) -> Option<u16> {
        u16::try_from(self.control_port).ok().filter(|port| *port > 0)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn session_sweep_period(&self) -> Duration {
        Duration::from_millis(self.session_sweep_period_ms)
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        if self.temp_dir.is_relative() {
            self.temp_dir = base_dir.as_ref().join(&self.temp_dir);
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.handler_count_max == 0 {
            return invalid("handlerCountMax must be at least 1".into());
        }
        if self.handler_count_startup > self.handler_count_max {
            return invalid(format!(
                "handlerCountStartup ({}) exceeds handlerCountMax ({})",
                self.handler_count_startup, self.handler_count_max
            ));
        }
        if self.request_pool_max == 0 || self.response_pool_max == 0 {
            return invalid("requestPoolMax and responsePoolMax must be at least 1".into());
        }
        if self.sweep_period_ms == 0 || self.session_sweep_period_ms == 0 {
            return invalid("sweep periods must be positive".into());
        }
        if self.use_cluster {
            if self.control_port().is_none() {
                return invalid("useCluster requires a controlPort".into());
            }
            if self.heartbeat_period_ms == 0 {
                return invalid("heartbeatPeriodMs must be positive".into());
            }
        }

        let mut prefixes = HashSet::new();
        for webapp in &self.webapps {
            let prefix = &webapp.prefix;
            if !(prefix.is_empty() || prefix.starts_with('/')) || prefix.ends_with('/') {
                return invalid(format!(
                    "webapp prefix {prefix:?} must be empty or start with '/' without a trailing '/'"
                ));
            }
            if !prefixes.insert(prefix.as_str()) {
                return invalid(format!("duplicate webapp prefix {prefix:?}"));
            }
        }

        let mut names = HashSet::new();
        for ds in &self.data_sources {
            if ds.name.is_empty() || ds.driver.is_empty() {
                return invalid("data sources need a name and a driver".into());
            }
            if ds.max_connections == 0 {
                return invalid(format!("data source {}: maxConnections must be at least 1", ds.name));
            }
            if !names.insert(ds.name.as_str()) {
                return invalid(format!("duplicate data source {:?}", ds.name));
            }
        }
        if self.mail_sessions.iter().any(|m| m.name.is_empty()) {
            return invalid("mail sessions need a name".into());
        }
        if self.env_entries.iter().any(|e| e.name.is_empty() || e.class_name.is_empty()) {
            return invalid("env entries need a name and a className".into());
        }
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
