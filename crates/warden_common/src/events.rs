//! Events Module
//!
//! Typed notifications exchanged over the daemon's event bus.
//!
//! ## Architecture
//!
//! ```text
//! +----------------+     +-----------+     +---------------------+
//! | health checker | --> |           | --> | wakelock manager    |
//! | service monitor| --> | EventBus  | --> | journal / observers |
//! | wakelock       | --> | (topics)  | --> | ...                 |
//! +----------------+     +-----------+     +---------------------+
//! ```
//!
//! Every payload variant belongs to exactly one dotted topic, so a subscriber
//! matching on [`EventKind`] never sees a payload shaped for another topic.

use crate::types::HealthCheckResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason carried by `service.restart.failed` once the attempt budget is spent
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Reason carried by `service.restart.failed` when the allow-list refuses the command
pub const COMMAND_REJECTED: &str = "restart command rejected";

// ============================================================================
// Topics
// ============================================================================

/// Dotted topic names
pub mod topics {
    pub const HEALTH_CHECK_STARTED: &str = "health.check.started";
    pub const HEALTH_CHECK_COMPLETED: &str = "health.check.completed";
    pub const HEALTH_CHECK_STOPPED: &str = "health.check.stopped";
    pub const HEALTH_CHECK_ERROR: &str = "health.check.error";
    pub const SERVICE_HEALTH_OK: &str = "service.health.ok";
    pub const SERVICE_HEALTH_FAILED: &str = "service.health.failed";
    pub const SERVICE_MONITOR_STARTED: &str = "service.monitor.started";
    pub const SERVICE_MONITOR_COMPLETED: &str = "service.monitor.completed";
    pub const SERVICE_MONITOR_ERROR: &str = "service.monitor.error";
    pub const SERVICE_MONITOR_STOPPED: &str = "service.monitor.stopped";
    pub const SERVICE_RESTART_STARTED: &str = "service.restart.started";
    pub const SERVICE_RESTART_COMPLETED: &str = "service.restart.completed";
    pub const SERVICE_RESTART_FAILED: &str = "service.restart.failed";
    pub const SERVICE_RUNNING: &str = "service.running";
    pub const WAKELOCK_ACQUIRED: &str = "wakelock.acquired";
    pub const WAKELOCK_RELEASED: &str = "wakelock.released";
    pub const WAKELOCK_ACQUIRE_FAILED: &str = "wakelock.acquire.failed";
    pub const WAKELOCK_RELEASE_FAILED: &str = "wakelock.release.failed";
    pub const WAKELOCK_SKIPPED_LOW_BATTERY: &str = "wakelock.skipped.lowbattery";
    pub const WAKELOCK_MONITORING_STARTED: &str = "wakelock.monitoring.started";
    pub const WAKELOCK_MANAGER_STOPPED: &str = "wakelock.manager.stopped";
    pub const BATTERY_LOW: &str = "system.battery.low";
    pub const BATTERY_NORMAL: &str = "system.battery.normal";
    pub const CONFIG_UPDATED: &str = "config.updated";

    /// Every topic the daemon publishes, in a stable order
    pub const ALL: &[&str] = &[
        HEALTH_CHECK_STARTED,
        HEALTH_CHECK_COMPLETED,
        HEALTH_CHECK_STOPPED,
        HEALTH_CHECK_ERROR,
        SERVICE_HEALTH_OK,
        SERVICE_HEALTH_FAILED,
        SERVICE_MONITOR_STARTED,
        SERVICE_MONITOR_COMPLETED,
        SERVICE_MONITOR_ERROR,
        SERVICE_MONITOR_STOPPED,
        SERVICE_RESTART_STARTED,
        SERVICE_RESTART_COMPLETED,
        SERVICE_RESTART_FAILED,
        SERVICE_RUNNING,
        WAKELOCK_ACQUIRED,
        WAKELOCK_RELEASED,
        WAKELOCK_ACQUIRE_FAILED,
        WAKELOCK_RELEASE_FAILED,
        WAKELOCK_SKIPPED_LOW_BATTERY,
        WAKELOCK_MONITORING_STARTED,
        WAKELOCK_MANAGER_STOPPED,
        BATTERY_LOW,
        BATTERY_NORMAL,
        CONFIG_UPDATED,
    ];
}

// ============================================================================
// Payloads
// ============================================================================

/// Payload of an event, one variant per topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data")]
pub enum EventKind {
    #[serde(rename = "health.check.started")]
    HealthCheckStarted { interval_ms: u64 },
    #[serde(rename = "health.check.completed")]
    HealthCheckCompleted { results: Vec<HealthCheckResult> },
    #[serde(rename = "health.check.stopped")]
    HealthCheckStopped,
    #[serde(rename = "health.check.error")]
    HealthCheckError { error: String },

    #[serde(rename = "service.health.ok")]
    ServiceHealthOk {
        service: String,
        latency_ms: Option<u64>,
    },
    #[serde(rename = "service.health.failed")]
    ServiceHealthFailed {
        service: String,
        error: Option<String>,
    },

    #[serde(rename = "service.monitor.started")]
    ServiceMonitorStarted,
    #[serde(rename = "service.monitor.completed")]
    ServiceMonitorCompleted { services: Vec<String> },
    #[serde(rename = "service.monitor.error")]
    ServiceMonitorError {
        service: Option<String>,
        error: String,
    },
    #[serde(rename = "service.monitor.stopped")]
    ServiceMonitorStopped,

    #[serde(rename = "service.restart.started")]
    ServiceRestartStarted { service: String, attempt: u32 },
    #[serde(rename = "service.restart.completed")]
    ServiceRestartCompleted { service: String, attempt: u32 },
    #[serde(rename = "service.restart.failed")]
    ServiceRestartFailed {
        service: String,
        /// Attempt number, absent when no attempt was made
        attempt: Option<u32>,
        reason: String,
        /// Set only when the attempt budget is exhausted
        max_retries: Option<u32>,
    },
    #[serde(rename = "service.running")]
    ServiceRunning { service: String },

    #[serde(rename = "wakelock.acquired")]
    WakelockAcquired,
    #[serde(rename = "wakelock.released")]
    WakelockReleased,
    #[serde(rename = "wakelock.acquire.failed")]
    WakelockAcquireFailed { error: String },
    #[serde(rename = "wakelock.release.failed")]
    WakelockReleaseFailed { error: String },
    #[serde(rename = "wakelock.skipped.lowbattery")]
    WakelockSkippedLowBattery,
    #[serde(rename = "wakelock.monitoring.started")]
    WakelockMonitoringStarted { interval_ms: u64 },
    #[serde(rename = "wakelock.manager.stopped")]
    WakelockManagerStopped,

    #[serde(rename = "system.battery.low")]
    BatteryLow { level: u8, threshold: u8 },
    #[serde(rename = "system.battery.normal")]
    BatteryNormal { level: u8 },

    #[serde(rename = "config.updated")]
    ConfigUpdated {
        /// Dotted key that changed; absent on a full reload
        key: Option<String>,
    },
}

impl EventKind {
    /// Topic this payload is published on
    pub fn topic(&self) -> &'static str {
        use topics::*;
        match self {
            EventKind::HealthCheckStarted { .. } => HEALTH_CHECK_STARTED,
            EventKind::HealthCheckCompleted { .. } => HEALTH_CHECK_COMPLETED,
            EventKind::HealthCheckStopped => HEALTH_CHECK_STOPPED,
            EventKind::HealthCheckError { .. } => HEALTH_CHECK_ERROR,
            EventKind::ServiceHealthOk { .. } => SERVICE_HEALTH_OK,
            EventKind::ServiceHealthFailed { .. } => SERVICE_HEALTH_FAILED,
            EventKind::ServiceMonitorStarted => SERVICE_MONITOR_STARTED,
            EventKind::ServiceMonitorCompleted { .. } => SERVICE_MONITOR_COMPLETED,
            EventKind::ServiceMonitorError { .. } => SERVICE_MONITOR_ERROR,
            EventKind::ServiceMonitorStopped => SERVICE_MONITOR_STOPPED,
            EventKind::ServiceRestartStarted { .. } => SERVICE_RESTART_STARTED,
            EventKind::ServiceRestartCompleted { .. } => SERVICE_RESTART_COMPLETED,
            EventKind::ServiceRestartFailed { .. } => SERVICE_RESTART_FAILED,
            EventKind::ServiceRunning { .. } => SERVICE_RUNNING,
            EventKind::WakelockAcquired => WAKELOCK_ACQUIRED,
            EventKind::WakelockReleased => WAKELOCK_RELEASED,
            EventKind::WakelockAcquireFailed { .. } => WAKELOCK_ACQUIRE_FAILED,
            EventKind::WakelockReleaseFailed { .. } => WAKELOCK_RELEASE_FAILED,
            EventKind::WakelockSkippedLowBattery => WAKELOCK_SKIPPED_LOW_BATTERY,
            EventKind::WakelockMonitoringStarted { .. } => WAKELOCK_MONITORING_STARTED,
            EventKind::WakelockManagerStopped => WAKELOCK_MANAGER_STOPPED,
            EventKind::BatteryLow { .. } => BATTERY_LOW,
            EventKind::BatteryNormal { .. } => BATTERY_NORMAL,
            EventKind::ConfigUpdated { .. } => CONFIG_UPDATED,
        }
    }

    /// One-line human description for the journal
    pub fn describe(&self) -> String {
        match self {
            EventKind::HealthCheckStarted { interval_ms } => {
                format!("health checker started (every {}ms)", interval_ms)
            }
            EventKind::HealthCheckCompleted { results } => {
                let healthy = results.iter().filter(|r| r.healthy).count();
                format!("health pass done: {}/{} healthy", healthy, results.len())
            }
            EventKind::HealthCheckStopped => "health checker stopped".to_string(),
            EventKind::HealthCheckError { error } => format!("health check error: {}", error),
            EventKind::ServiceHealthOk { service, latency_ms } => match latency_ms {
                Some(ms) => format!("{} healthy ({}ms)", service, ms),
                None => format!("{} healthy", service),
            },
            EventKind::ServiceHealthFailed { service, error } => format!(
                "{} unhealthy: {}",
                service,
                error.as_deref().unwrap_or("no response")
            ),
            EventKind::ServiceMonitorStarted => "monitor pass started".to_string(),
            EventKind::ServiceMonitorCompleted { services } => {
                format!("monitor pass done ({} services)", services.len())
            }
            EventKind::ServiceMonitorError { service, error } => match service {
                Some(s) => format!("monitor error on {}: {}", s, error),
                None => format!("monitor error: {}", error),
            },
            EventKind::ServiceMonitorStopped => "service monitor stopped".to_string(),
            EventKind::ServiceRestartStarted { service, attempt } => {
                format!("restarting {} (attempt {})", service, attempt)
            }
            EventKind::ServiceRestartCompleted { service, attempt } => {
                format!("{} restarted on attempt {}", service, attempt)
            }
            EventKind::ServiceRestartFailed {
                service, reason, ..
            } => format!("restart of {} failed: {}", service, reason),
            EventKind::ServiceRunning { service } => format!("{} running", service),
            EventKind::WakelockAcquired => "wake lock acquired".to_string(),
            EventKind::WakelockReleased => "wake lock released".to_string(),
            EventKind::WakelockAcquireFailed { error } => {
                format!("wake lock acquire failed: {}", error)
            }
            EventKind::WakelockReleaseFailed { error } => {
                format!("wake lock release failed: {}", error)
            }
            EventKind::WakelockSkippedLowBattery => {
                "wake lock skipped, battery too low".to_string()
            }
            EventKind::WakelockMonitoringStarted { interval_ms } => {
                format!("wake lock monitoring every {}ms", interval_ms)
            }
            EventKind::WakelockManagerStopped => "wake lock manager stopped".to_string(),
            EventKind::BatteryLow { level, threshold } => {
                format!("battery low: {}% < {}%", level, threshold)
            }
            EventKind::BatteryNormal { level } => format!("battery at {}%", level),
            EventKind::ConfigUpdated { key } => match key {
                Some(k) => format!("config updated: {}", k),
                None => "config reloaded".to_string(),
            },
        }
    }
}

/// A published event. Immutable once built, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardenEvent {
    /// When this event was published
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl WardenEvent {
    /// Create a new event stamped with the current time
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }
}

impl fmt::Display for WardenEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.topic(), self.kind.describe())
    }
}
