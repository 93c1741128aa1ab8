//! Service monitor
//!
//! Polls each configured service through the process supervisor and
//! restarts the ones that are down, with a per-service retry budget.
//!
//! Restart state machine per service:
//! - running: attempts reset to 0
//! - stopped, attempts < maxRetries: attempts += 1, restart
//! - stopped, attempts >= maxRetries: `service.restart.failed` with
//!   "max retries exceeded", nothing executed
//! - restart succeeded: attempts reset to 0

use crate::bus::EventBus;
use crate::config::ConfigStore;
use crate::schedule::{FirstTick, PeriodicTask, ScheduleError, MIN_INTERVAL_MS};
use crate::supervisor::{
    CommandGuard, ProcessSupervisor, SupervisorAction, SupervisorStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use warden_common::{
    EventKind, ServiceReport, ServiceStatus, COMMAND_REJECTED, MAX_RETRIES_EXCEEDED,
};

const TASK_NAME: &str = "service monitor";

const DEFAULT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_STATUS_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RESTART_TIMEOUT_MS: u64 = 10_000;

pub struct ServiceMonitor {
    bus: Arc<EventBus>,
    config: Arc<ConfigStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    guard: CommandGuard,
    attempts: Mutex<HashMap<String, u32>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl ServiceMonitor {
    pub fn new(
        bus: Arc<EventBus>,
        config: Arc<ConfigStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            bus,
            config,
            supervisor,
            guard: CommandGuard::new(),
            attempts: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    fn max_retries(&self) -> u32 {
        self.config.get_or("serviceMonitor.maxRetries", DEFAULT_MAX_RETRIES)
    }

    fn timeout(&self, key: &str, default_ms: u64) -> Duration {
        Duration::from_millis(self.config.get_or(key, default_ms))
    }

    /// Consecutive restart attempts recorded for `service`
    pub fn attempts(&self, service: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    fn reset_attempts(&self, service: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.to_string(), 0);
    }

    /// Ask the supervisor whether `service` is running.
    ///
    /// Names that fail the allow-list come back `Unknown` without anything
    /// being executed; query errors count as `Stopped`.
    pub async fn check_service(&self, service: &str) -> ServiceReport {
        let command = self
            .supervisor
            .command_for(SupervisorAction::Describe, service);
        if let Err(e) = self.guard.check(&command) {
            warn!("Refusing status query for {:?}: {}", service, e);
            return ServiceReport::new(service, ServiceStatus::Unknown);
        }

        let timeout = self.timeout("serviceMonitor.statusTimeout", DEFAULT_STATUS_TIMEOUT_MS);
        let status = match self.supervisor.status(service, timeout).await {
            Ok(SupervisorStatus::Online) => ServiceStatus::Running,
            Ok(SupervisorStatus::Offline) => ServiceStatus::Stopped,
            Err(e) => {
                warn!("Status query for {} failed: {}", service, e);
                ServiceStatus::Stopped
            }
        };
        ServiceReport::new(service, status)
    }

    /// Attempt one restart of `service` within the retry budget
    pub async fn restart_service(&self, service: &str) {
        let command = self
            .supervisor
            .command_for(SupervisorAction::Restart, service);
        if let Err(e) = self.guard.check(&command) {
            warn!("Refusing restart of {:?}: {}", service, e);
            self.bus.publish(EventKind::ServiceRestartFailed {
                service: service.to_string(),
                attempt: None,
                reason: COMMAND_REJECTED.to_string(),
                max_retries: None,
            });
            return;
        }

        let max_retries = self.max_retries();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let current = attempts.entry(service.to_string()).or_insert(0);
            if *current >= max_retries {
                None
            } else {
                *current += 1;
                Some(*current)
            }
        };

        let Some(attempt) = attempt else {
            error!("{}: giving up after {} restart attempts", service, max_retries);
            self.bus.publish(EventKind::ServiceRestartFailed {
                service: service.to_string(),
                attempt: None,
                reason: MAX_RETRIES_EXCEEDED.to_string(),
                max_retries: Some(max_retries),
            });
            return;
        };

        info!("Restarting {} (attempt {}/{})", service, attempt, max_retries);
        self.bus.publish(EventKind::ServiceRestartStarted {
            service: service.to_string(),
            attempt,
        });

        let timeout = self.timeout("serviceMonitor.restartTimeout", DEFAULT_RESTART_TIMEOUT_MS);
        match self.supervisor.restart(service, timeout).await {
            Ok(()) => {
                self.reset_attempts(service);
                info!("{} restarted", service);
                self.bus.publish(EventKind::ServiceRestartCompleted {
                    service: service.to_string(),
                    attempt,
                });
            }
            Err(e) => {
                warn!("Restart of {} failed: {}", service, e);
                self.bus.publish(EventKind::ServiceRestartFailed {
                    service: service.to_string(),
                    attempt: Some(attempt),
                    reason: e.to_string(),
                    max_retries: None,
                });
            }
        }
    }

    /// Check one service and act on its status
    async fn supervise(&self, service: &str) {
        let report = self.check_service(service).await;
        match report.status {
            ServiceStatus::Running => {
                self.reset_attempts(service);
                debug!("{} running", service);
                self.bus.publish(EventKind::ServiceRunning {
                    service: service.to_string(),
                });
            }
            ServiceStatus::Stopped => {
                warn!("{} is not running", service);
                self.restart_service(service).await;
            }
            ServiceStatus::Unknown => {
                self.bus.publish(EventKind::ServiceMonitorError {
                    service: Some(service.to_string()),
                    error: "invalid service name".to_string(),
                });
            }
        }
    }

    /// One pass over `serviceMonitor.services`, in configuration order
    pub async fn monitor(self: &Arc<Self>) {
        let services = match self.config.get("serviceMonitor.services") {
            Some(Value::Array(services)) => services,
            other => {
                error!("serviceMonitor.services must be an array (got {:?})", other);
                self.bus.publish(EventKind::ServiceMonitorError {
                    service: None,
                    error: "serviceMonitor.services must be an array".to_string(),
                });
                return;
            }
        };

        self.bus.publish(EventKind::ServiceMonitorStarted);

        let mut names = Vec::with_capacity(services.len());
        for raw in &services {
            let Some(name) = raw.as_str() else {
                warn!("Skipping non-string service entry {}", raw);
                self.bus.publish(EventKind::ServiceMonitorError {
                    service: Some(raw.to_string()),
                    error: "service name must be a string".to_string(),
                });
                continue;
            };
            names.push(name.to_string());

            // A panic inside one service's check surfaces as a JoinError here
            let monitor = Arc::clone(self);
            let service = name.to_string();
            let outcome = tokio::spawn(async move { monitor.supervise(&service).await }).await;
            if let Err(e) = outcome {
                error!("Monitoring {} aborted: {}", name, e);
                self.bus.publish(EventKind::ServiceMonitorError {
                    service: Some(name.to_string()),
                    error: e.to_string(),
                });
            }
        }

        debug!("monitor pass over {} services done", names.len());
        self.bus
            .publish(EventKind::ServiceMonitorCompleted { services: names });
    }

    /// Start polling every `serviceMonitor.checkInterval`.
    ///
    /// The first pass runs immediately.
    pub fn start(self: &Arc<Self>) -> Result<(), ScheduleError> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Err(ScheduleError::AlreadyRunning(TASK_NAME));
        }

        let interval_ms = self
            .config
            .get_or("serviceMonitor.checkInterval", DEFAULT_INTERVAL_MS);
        if interval_ms < MIN_INTERVAL_MS {
            return Err(ScheduleError::IntervalTooShort {
                name: TASK_NAME,
                interval_ms,
            });
        }

        let monitor = Arc::clone(self);
        *task = Some(PeriodicTask::spawn(
            TASK_NAME,
            Duration::from_millis(interval_ms),
            FirstTick::Immediate,
            move || {
                let monitor = Arc::clone(&monitor);
                async move {
                    monitor.monitor().await;
                }
            },
        ));

        info!("Service monitor started (every {}ms)", interval_ms);
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
            info!("Service monitor stopped");
            self.bus.publish(EventKind::ServiceMonitorStopped);
        }
    }
}
