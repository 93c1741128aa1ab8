//! Daemon wiring
//!
//! Builds the bus and the three supervision components, starts them in a
//! fixed order, and tears them down again on SIGINT/SIGTERM.

use crate::battery::{BatterySource, TermuxBattery};
use crate::bus::{handler, EventBus};
use crate::config::ConfigStore;
use crate::health::HealthChecker;
use crate::monitor::ServiceMonitor;
use crate::supervisor::{Pm2Supervisor, ProcessSupervisor};
use crate::wakelock::{TermuxWakeLock, WakeLockPrimitive, WakelockManager};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};
use warden_common::{topics, EventKind};

/// Log every known topic at debug level
pub fn attach_journal(bus: &EventBus) {
    for topic in topics::ALL {
        bus.subscribe(
            topic,
            handler(|event| {
                debug!(target: "wardend::journal", "{}", event);
                Ok(())
            }),
        );
    }
}

pub struct Warden {
    pub bus: Arc<EventBus>,
    pub config: Arc<ConfigStore>,
    pub health: Arc<HealthChecker>,
    pub monitor: Arc<ServiceMonitor>,
    pub wakelock: Arc<WakelockManager>,
}

impl Warden {
    /// Production wiring: pm2, termux-wake-lock and termux-battery-status
    pub fn new(bus: Arc<EventBus>, config: Arc<ConfigStore>) -> Self {
        Self::with_collaborators(
            bus,
            config,
            Arc::new(Pm2Supervisor::new()),
            Arc::new(TermuxWakeLock::new()),
            Arc::new(TermuxBattery::new()),
        )
    }

    pub fn with_collaborators(
        bus: Arc<EventBus>,
        config: Arc<ConfigStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
        primitive: Arc<dyn WakeLockPrimitive>,
        battery: Arc<dyn BatterySource>,
    ) -> Self {
        let health = Arc::new(HealthChecker::new(Arc::clone(&bus), Arc::clone(&config)));
        let monitor = Arc::new(ServiceMonitor::new(
            Arc::clone(&bus),
            Arc::clone(&config),
            supervisor,
        ));
        let wakelock =
            WakelockManager::new(Arc::clone(&bus), Arc::clone(&config), primitive, battery);

        Self {
            bus,
            config,
            health,
            monitor,
            wakelock,
        }
    }

    /// Acquire the wake lock, then start the three loops.
    ///
    /// A loop that refuses to start is logged and the rest carry on.
    pub async fn start(&self) {
        self.wakelock.acquire().await;

        if let Err(e) = self.wakelock.start_monitoring() {
            error!("Wake lock monitoring not started: {}", e);
        }

        if let Err(e) = self.health.start() {
            error!("Health checker not started: {}", e);
            self.bus.publish(EventKind::HealthCheckError {
                error: e.to_string(),
            });
        }

        if let Err(e) = self.monitor.start() {
            error!("Service monitor not started: {}", e);
            self.bus.publish(EventKind::ServiceMonitorError {
                service: None,
                error: e.to_string(),
            });
        }
    }

    /// Stop every loop (waiting for in-flight passes) and release the lock
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.health.stop().await;
        self.monitor.stop().await;
        self.wakelock.stop().await;
        info!("Shutdown complete");
    }

    /// Run until `signal` resolves, then shut down whatever it returned.
    ///
    /// Teardown happens on the error path too; a wake lock left held
    /// outlives the process.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        self.start().await;
        info!("wardend ready");

        let outcome = signal.await;
        if let Err(e) = &outcome {
            error!("Signal wait failed: {:#}", e);
        }
        self.shutdown().await;
        outcome
    }
}

/// Run until SIGINT or SIGTERM
pub async fn run(config: ConfigStore) -> Result<()> {
    let bus = Arc::new(EventBus::new());
    attach_journal(&bus);
    let config = Arc::new(config.attach_bus(Arc::clone(&bus)));

    Warden::new(bus, config).run_until(wait_for_signal()).await
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received SIGINT");
        }
        _ = term.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    Ok(())
}
