//! Configuration schema for warden.
//!
//! Settings are read from a TOML file and deep-merged over built-in defaults.
//! The merged tree is kept as a JSON value so the daemon can address it with
//! dotted keys (`healthCheck.checkInterval`); the typed view below is used to
//! validate it at load time.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Config file path on a Termux install
pub const CONFIG_PATH: &str = "/data/data/com.termux/files/home/.config/warden/config.toml";

/// Intervals below this are flagged at load
pub const MIN_RECOMMENDED_INTERVAL_MS: u64 = 1000;

/// Environment variables that override the `paths` section
const PATH_OVERRIDES: &[(&str, &str)] = &[
    ("WEBSITE_DIR", "paths.websiteDir"),
    ("LOGS_DIR", "paths.logsDir"),
    ("TEMP_DIR", "paths.tempDir"),
    ("PID_DIR", "paths.pidDir"),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("{key} must be between 1 and 65535 (got {value})")]
    PortOutOfRange { key: &'static str, value: u32 },

    #[error("wakelock.minBatteryLevel must be between 0 and 100 (got {0})")]
    BatteryLevelOutOfRange(u32),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Ports are kept wide here so range errors are reported, not truncated
    pub port: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsConfig {
    #[serde(default = "default_website_dir")]
    pub website_dir: String,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    #[serde(default = "default_termux_tmp")]
    pub temp_dir: String,
    #[serde(default = "default_termux_tmp")]
    pub pid_dir: String,
}

fn default_website_dir() -> String {
    "/data/data/com.termux/files/home/my-website".to_string()
}

fn default_logs_dir() -> String {
    "/data/data/com.termux/files/home/logs".to_string()
}

fn default_termux_tmp() -> String {
    "/data/data/com.termux/files/usr/tmp".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            website_dir: default_website_dir(),
            logs_dir: default_logs_dir(),
            temp_dir: default_termux_tmp(),
            pid_dir: default_termux_tmp(),
        }
    }
}

/// Health checker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Raw check list; individual entries are validated per pass, not at load
    #[serde(default = "default_checks")]
    pub checks: Value,

    #[serde(default = "default_health_interval")]
    pub check_interval: u64,

    /// Per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
}

fn default_checks() -> Value {
    json!([
        { "name": "SSH", "port": 8022, "type": "tcp" },
        { "name": "Web", "port": 8000, "type": "http" }
    ])
}

fn default_health_interval() -> u64 {
    30_000
}

fn default_probe_timeout() -> u64 {
    5_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            checks: default_checks(),
            check_interval: default_health_interval(),
            timeout: default_probe_timeout(),
        }
    }
}

/// Service monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorConfig {
    /// Raw service name list, validated per pass
    #[serde(default = "default_services")]
    pub services: Value,

    #[serde(default = "default_monitor_interval")]
    pub check_interval: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// `pm2 describe` timeout in milliseconds
    #[serde(default = "default_status_timeout")]
    pub status_timeout: u64,

    /// `pm2 restart` timeout in milliseconds
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout: u64,
}

fn default_services() -> Value {
    json!(["sshd", "webserver"])
}

fn default_monitor_interval() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_status_timeout() -> u64 {
    5_000
}

fn default_restart_timeout() -> u64 {
    10_000
}

impl Default for ServiceMonitorConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            check_interval: default_monitor_interval(),
            max_retries: default_max_retries(),
            status_timeout: default_status_timeout(),
            restart_timeout: default_restart_timeout(),
        }
    }
}

/// Wake lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakelockConfig {
    #[serde(default = "default_wakelock_interval")]
    pub check_interval: u64,

    #[serde(default = "default_true")]
    pub enable_battery_check: bool,

    #[serde(default = "default_min_battery")]
    pub min_battery_level: u32,

    #[serde(default = "default_true")]
    pub auto_release_on_low_battery: bool,

    /// Timeout for the termux wake/battery commands in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

fn default_wakelock_interval() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_min_battery() -> u32 {
    20
}

fn default_command_timeout() -> u64 {
    5_000
}

impl Default for WakelockConfig {
    fn default() -> Self {
        Self {
            check_interval: default_wakelock_interval(),
            enable_battery_check: true,
            min_battery_level: default_min_battery(),
            auto_release_on_low_battery: true,
            command_timeout: default_command_timeout(),
        }
    }
}

/// Complete warden configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardenConfig {
    #[serde(default = "default_ssh_server")]
    pub ssh_server: ServerConfig,
    #[serde(default = "default_web_server")]
    pub web_server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub service_monitor: ServiceMonitorConfig,
    #[serde(default)]
    pub wakelock: WakelockConfig,
}

fn default_ssh_server() -> ServerConfig {
    ServerConfig { port: 8022 }
}

fn default_web_server() -> ServerConfig {
    ServerConfig { port: 8000 }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            ssh_server: default_ssh_server(),
            web_server: default_web_server(),
            paths: PathsConfig::default(),
            health_check: HealthCheckConfig::default(),
            service_monitor: ServiceMonitorConfig::default(),
            wakelock: WakelockConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Check the invariants that make it unsafe to run at all.
    ///
    /// Intervals under a second are only warned about.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_port("sshServer.port", self.ssh_server.port)?;
        check_port("webServer.port", self.web_server.port)?;

        if self.wakelock.min_battery_level > 100 {
            return Err(ConfigError::BatteryLevelOutOfRange(
                self.wakelock.min_battery_level,
            ));
        }

        let intervals = [
            ("healthCheck.checkInterval", self.health_check.check_interval),
            ("serviceMonitor.checkInterval", self.service_monitor.check_interval),
            ("wakelock.checkInterval", self.wakelock.check_interval),
        ];
        for (key, value) in intervals {
            if value < MIN_RECOMMENDED_INTERVAL_MS {
                warn!(
                    "{} is {}ms; intervals under {}ms are not recommended",
                    key, value, MIN_RECOMMENDED_INTERVAL_MS
                );
            }
        }

        Ok(())
    }
}

fn check_port(key: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 || value > u16::MAX as u32 {
        return Err(ConfigError::PortOutOfRange { key, value });
    }
    Ok(())
}

// ============================================================================
// Tree helpers
// ============================================================================

/// Default configuration as a JSON tree
pub fn default_tree() -> Value {
    // Serializing a plain struct of strings, numbers and JSON values cannot fail
    serde_json::to_value(WardenConfig::default()).unwrap_or(Value::Null)
}

/// Merge `overlay` into `base`: objects merge key by key, anything else replaces
pub fn merge_tree(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_tree(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Look up a dotted key
pub fn lookup<'a>(tree: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(tree, |node, part| node.as_object()?.get(part))
}

/// Set a dotted key, creating intermediate objects as needed
pub fn assign(tree: &mut Value, key: &str, value: Value) {
    let mut node = tree;
    let mut parts = key.split('.').peekable();

    while let Some(part) = parts.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Validate a tree by deserializing it into the typed view
pub fn validate_tree(tree: &Value) -> Result<WardenConfig, ConfigError> {
    let config: WardenConfig = serde_json::from_value(tree.clone())?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from `path` merged over defaults.
///
/// A missing file is not an error: defaults are used. Environment path
/// overrides are applied last, then the result is validated.
pub fn load_tree(path: &Path) -> Result<Value, ConfigError> {
    let mut tree = default_tree();

    if path.exists() {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let user: toml::Value = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        merge_tree(&mut tree, serde_json::to_value(user)?);
        info!("Loaded config from {}", path.display());
    } else {
        info!("No config at {}, using defaults", path.display());
    }

    for (var, key) in PATH_OVERRIDES {
        if let Ok(value) = std::env::var(var) {
            assign(&mut tree, key, Value::String(value));
        }
    }

    validate_tree(&tree)?;
    Ok(tree)
}
