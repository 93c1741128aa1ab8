//! Health checker
//!
//! Probes the configured endpoints (TCP connect or HTTP GET) on a fixed
//! interval and publishes one `service.health.ok|failed` per check followed
//! by `health.check.completed` with the whole pass.
//!
//! Probes never fail loudly: refusal, timeout and malformed specs all come
//! back as an unhealthy result.

use crate::bus::EventBus;
use crate::config::ConfigStore;
use crate::schedule::{FirstTick, PeriodicTask, ScheduleError, MIN_INTERVAL_MS};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use warden_common::{CheckKind, EventKind, HealthCheckResult, HealthCheckSpec};

const TASK_NAME: &str = "health checker";

const DEFAULT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// Probes
// ============================================================================

/// Connect to `host:port` within `timeout`, or say why not.
///
/// The connection is dropped straight away.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> Result<(), String> {
    if host.is_empty() || port == 0 {
        return Err("invalid target".to_string());
    }

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}

/// `GET http://host:port/` within `timeout`; any status below 400 is alive.
///
/// Redirects are not followed; a 3xx counts as alive.
pub async fn probe_http(host: &str, port: u16, timeout: Duration) -> Result<(), String> {
    if host.is_empty() || port == 0 {
        return Err("invalid target".to_string());
    }

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .map_err(|e| format!("failed to build HTTP client: {}", e))?;

    let url = if host.contains(':') {
        format!("http://[{}]:{}/", host, port)
    } else {
        format!("http://{}:{}/", host, port)
    };

    match client.get(&url).send().await {
        Ok(response) if response.status().as_u16() < 400 => Ok(()),
        Ok(response) => Err(format!("HTTP {}", response.status().as_u16())),
        Err(e) if e.is_timeout() => Err(format!("timed out after {}ms", timeout.as_millis())),
        Err(e) => Err(format!("request failed: {}", e)),
    }
}

/// True if a TCP connection to `host:port` establishes within `timeout`
pub async fn check_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    match probe_tcp(host, port, timeout).await {
        Ok(()) => true,
        Err(e) => {
            debug!("tcp {}:{} unhealthy: {}", host, port, e);
            false
        }
    }
}

/// True if `GET http://host:port/` answers below 400 within `timeout`
pub async fn check_http(host: &str, port: u16, timeout: Duration) -> bool {
    match probe_http(host, port, timeout).await {
        Ok(()) => true,
        Err(e) => {
            debug!("http {}:{} unhealthy: {}", host, port, e);
            false
        }
    }
}

/// Interpret one raw entry of `healthCheck.checks`
pub fn parse_check(raw: &Value) -> Result<HealthCheckSpec, (String, String)> {
    let name = raw.get("name").and_then(Value::as_str).unwrap_or("");
    let display = if name.is_empty() { "unknown" } else { name }.to_string();

    let port = raw.get("port").and_then(Value::as_u64);
    let kind = raw.get("type").and_then(Value::as_str);

    let (Some(port), Some(kind)) = (port, kind) else {
        return Err((display, "incomplete check configuration".to_string()));
    };
    if name.is_empty() {
        return Err((display, "incomplete check configuration".to_string()));
    }
    let Ok(port) = u16::try_from(port) else {
        return Err((display, format!("port out of range: {}", port)));
    };
    if port == 0 {
        return Err((display, "port out of range: 0".to_string()));
    }
    let Some(kind) = CheckKind::parse(kind) else {
        return Err((display, format!("unsupported check type: {}", kind)));
    };

    let mut spec = HealthCheckSpec::new(name, port, kind);
    if let Some(host) = raw.get("host").and_then(Value::as_str) {
        spec = spec.with_host(host);
    }
    Ok(spec)
}

// ============================================================================
// Checker
// ============================================================================

pub struct HealthChecker {
    bus: Arc<EventBus>,
    config: Arc<ConfigStore>,
    task: Mutex<Option<PeriodicTask>>,
}

impl HealthChecker {
    pub fn new(bus: Arc<EventBus>, config: Arc<ConfigStore>) -> Self {
        Self {
            bus,
            config,
            task: Mutex::new(None),
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.get_or("healthCheck.timeout", DEFAULT_TIMEOUT_MS))
    }

    /// Probe one endpoint
    pub async fn probe(&self, spec: &HealthCheckSpec) -> HealthCheckResult {
        let timeout = self.probe_timeout();
        let start = Instant::now();

        let outcome = match spec.kind {
            CheckKind::Tcp => probe_tcp(spec.host(), spec.port, timeout).await,
            CheckKind::Http => probe_http(spec.host(), spec.port, timeout).await,
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => HealthCheckResult::healthy(&spec.name, latency_ms),
            Err(e) => HealthCheckResult::unhealthy(&spec.name, Some(e), Some(latency_ms)),
        }
    }

    /// Validate a raw check entry and probe it
    pub async fn perform_check(&self, raw: &Value) -> HealthCheckResult {
        match parse_check(raw) {
            Ok(spec) => self.probe(&spec).await,
            Err((name, error)) => HealthCheckResult::unhealthy(&name, Some(error), None),
        }
    }

    /// One pass over every configured check, in configuration order
    pub async fn run_checks(&self) -> Vec<HealthCheckResult> {
        let checks = match self.config.get("healthCheck.checks") {
            Some(Value::Array(checks)) => checks,
            other => {
                error!("healthCheck.checks must be an array (got {:?})", other);
                self.bus.publish(EventKind::HealthCheckError {
                    error: "healthCheck.checks must be an array".to_string(),
                });
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(checks.len());
        for raw in &checks {
            let result = self.perform_check(raw).await;

            if result.healthy {
                info!("{} healthy", result.name);
                self.bus.publish(EventKind::ServiceHealthOk {
                    service: result.name.clone(),
                    latency_ms: result.latency_ms,
                });
            } else {
                warn!(
                    "{} unhealthy: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("no response")
                );
                self.bus.publish(EventKind::ServiceHealthFailed {
                    service: result.name.clone(),
                    error: result.error.clone(),
                });
            }
            results.push(result);
        }

        self.bus.publish(EventKind::HealthCheckCompleted {
            results: results.clone(),
        });
        results
    }

    /// Run a pass now and then every `healthCheck.checkInterval`.
    ///
    /// A short interval is warned about but honoured.
    pub fn start(self: &Arc<Self>) -> Result<(), ScheduleError> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Err(ScheduleError::AlreadyRunning(TASK_NAME));
        }

        let interval_ms = self
            .config
            .get_or("healthCheck.checkInterval", DEFAULT_INTERVAL_MS)
            .max(1);
        if interval_ms < MIN_INTERVAL_MS {
            warn!(
                "Health check interval {}ms is below {}ms; tight polling may exhaust the host",
                interval_ms, MIN_INTERVAL_MS
            );
        }

        info!("Health checker started (every {}ms)", interval_ms);
        self.bus.publish(EventKind::HealthCheckStarted { interval_ms });

        let checker = Arc::clone(self);
        *task = Some(PeriodicTask::spawn(
            TASK_NAME,
            Duration::from_millis(interval_ms),
            FirstTick::Immediate,
            move || {
                let checker = Arc::clone(&checker);
                async move {
                    checker.run_checks().await;
                }
            },
        ));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Cancel the timer, letting an in-flight pass finish
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.stop().await;
            info!("Health checker stopped");
            self.bus.publish(EventKind::HealthCheckStopped);
        }
    }
}
