//! Shared supervision types
//!
//! Probe specifications and results, and the service status vocabulary used by
//! the monitor. These are plain data; the daemon owns all behaviour.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host probed when a check does not name one
pub const DEFAULT_CHECK_HOST: &str = "localhost";

// ============================================================================
// Health checks
// ============================================================================

/// Kind of liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// Plain TCP connect
    Tcp,
    /// HTTP GET, healthy on a status below 400
    Http,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Tcp => "tcp",
            CheckKind::Http => "http",
        }
    }

    /// Parse the configuration spelling (`tcp` / `http`, case-insensitive)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "tcp" => Some(CheckKind::Tcp),
            "http" => Some(CheckKind::Http),
            _ => None,
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured endpoint to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub name: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: CheckKind,
    /// Target host; `localhost` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl HealthCheckSpec {
    pub fn new(name: &str, port: u16, kind: CheckKind) -> Self {
        Self {
            name: name.to_string(),
            port,
            kind,
            host: None,
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_CHECK_HOST)
    }
}

/// Outcome of one probe. Produced fresh each pass and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Probe duration, absent when the probe never ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl HealthCheckResult {
    pub fn healthy(name: &str, latency_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            timestamp: Utc::now(),
            error: None,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn unhealthy(name: &str, error: Option<String>, latency_ms: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            healthy: false,
            timestamp: Utc::now(),
            error,
            latency_ms,
        }
    }
}

// ============================================================================
// Service status
// ============================================================================

/// Status of a supervised service as reported by the process supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    /// The name itself was unusable, so nothing was queried
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub name: String,
    pub status: ServiceStatus,
}

impl ServiceReport {
    pub fn new(name: &str, status: ServiceStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_kind_parse() {
        assert_eq!(CheckKind::parse("tcp"), Some(CheckKind::Tcp));
        assert_eq!(CheckKind::parse("HTTP"), Some(CheckKind::Http));
        assert_eq!(CheckKind::parse("udp"), None);
    }

    #[test]
    fn test_spec_uses_type_key_and_default_host() {
        let spec: HealthCheckSpec =
            serde_json::from_str(r#"{"name":"SSH","port":8022,"type":"tcp"}"#).unwrap();
        assert_eq!(spec.kind, CheckKind::Tcp);
        assert_eq!(spec.host(), "localhost");

        let spec = spec.with_host("127.0.0.1");
        assert_eq!(spec.host(), "127.0.0.1");
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = HealthCheckResult::healthy("Web", 12);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["latencyMs"], 12);
        assert!(json.get("error").is_none());
    }
}
