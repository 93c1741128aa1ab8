//! Wake lock manager
//!
//! Keeps the device awake while the battery allows it. The lock is taken
//! through a [`WakeLockPrimitive`] (termux-wake-lock on the device) and gated
//! on a [`BatterySource`] reading. When the battery drops below
//! `wakelock.minBatteryLevel` the manager publishes `system.battery.low`,
//! and its own subscription to that topic releases a held lock if
//! `wakelock.autoReleaseOnLowBattery` is on.

use crate::battery::BatterySource;
use crate::bus::{handler, EventBus, Handler};
use crate::config::ConfigStore;
use crate::exec::{run_command, ExecError};
use crate::schedule::{FirstTick, PeriodicTask, ScheduleError, MIN_INTERVAL_MS};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_common::{topics, EventKind};

const TASK_NAME: &str = "wake lock manager";

const DEFAULT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_MIN_BATTERY: u8 = 20;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum WakeLockError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Primitive
// ============================================================================

#[async_trait]
pub trait WakeLockPrimitive: Send + Sync {
    async fn acquire(&self, timeout: Duration) -> Result<(), WakeLockError>;
    async fn release(&self, timeout: Duration) -> Result<(), WakeLockError>;
}

/// termux-wake-lock / termux-wake-unlock
#[derive(Debug, Default)]
pub struct TermuxWakeLock;

impl TermuxWakeLock {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WakeLockPrimitive for TermuxWakeLock {
    async fn acquire(&self, timeout: Duration) -> Result<(), WakeLockError> {
        run_command("termux-wake-lock", &[], timeout).await?;
        Ok(())
    }

    async fn release(&self, timeout: Duration) -> Result<(), WakeLockError> {
        run_command("termux-wake-unlock", &[], timeout).await?;
        Ok(())
    }
}

/// Counts calls and fails on demand
#[derive(Debug, Default)]
pub struct FakeWakeLock {
    acquires: AtomicUsize,
    releases: AtomicUsize,
    fail_acquire: AtomicBool,
    fail_release: AtomicBool,
}

impl FakeWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WakeLockPrimitive for FakeWakeLock {
    async fn acquire(&self, _timeout: Duration) -> Result<(), WakeLockError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(WakeLockError::Other("wake lock unavailable".to_string()));
        }
        Ok(())
    }

    async fn release(&self, _timeout: Duration) -> Result<(), WakeLockError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(WakeLockError::Other("wake unlock failed".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct WakelockManager {
    bus: Arc<EventBus>,
    config: Arc<ConfigStore>,
    primitive: Arc<dyn WakeLockPrimitive>,
    battery: Arc<dyn BatterySource>,
    /// Serializes acquire/release so a lock is never taken twice
    held: tokio::sync::Mutex<bool>,
    /// Mirror of `held` readable without awaiting
    locked: AtomicBool,
    low_battery: Mutex<Option<Handler>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl WakelockManager {
    /// Build the manager and subscribe it to `system.battery.low`
    pub fn new(
        bus: Arc<EventBus>,
        config: Arc<ConfigStore>,
        primitive: Arc<dyn WakeLockPrimitive>,
        battery: Arc<dyn BatterySource>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            bus: Arc::clone(&bus),
            config,
            primitive,
            battery,
            held: tokio::sync::Mutex::new(false),
            locked: AtomicBool::new(false),
            low_battery: Mutex::new(Some(Self::low_battery_handler(weak.clone()))),
            task: Mutex::new(None),
        });

        if let Some(h) = manager
            .low_battery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            bus.subscribe(topics::BATTERY_LOW, Arc::clone(h));
        }
        manager
    }

    fn low_battery_handler(weak: Weak<Self>) -> Handler {
        handler(move |_event| {
            let Some(manager) = weak.upgrade() else {
                return Ok(());
            };
            if !manager.auto_release() || !manager.is_locked() {
                return Ok(());
            }
            let runtime = tokio::runtime::Handle::try_current()?;
            info!("Battery low, releasing wake lock");
            runtime.spawn(async move {
                manager.release().await;
            });
            Ok(())
        })
    }

    fn auto_release(&self) -> bool {
        self.config.get_or("wakelock.autoReleaseOnLowBattery", true)
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(
            self.config.get_or("wakelock.commandTimeout", DEFAULT_COMMAND_TIMEOUT_MS),
        )
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// True if the battery permits holding the lock.
    ///
    /// With the check disabled this is always true. A failed reading is
    /// treated as permitting, so a missing termux-api never blocks the lock.
    pub async fn check_battery_level(&self) -> bool {
        if !self.config.get_or("wakelock.enableBatteryCheck", true) {
            return true;
        }

        let threshold = self
            .config
            .get_or("wakelock.minBatteryLevel", DEFAULT_MIN_BATTERY);
        let level = match self.battery.percentage(self.command_timeout()).await {
            Ok(level) => level,
            Err(e) => {
                warn!("Battery level unavailable, assuming sufficient: {}", e);
                return true;
            }
        };

        if level < threshold {
            warn!("Battery at {}% (minimum {}%)", level, threshold);
            self.bus.publish(EventKind::BatteryLow { level, threshold });
            false
        } else {
            debug!("Battery at {}%", level);
            self.bus.publish(EventKind::BatteryNormal { level });
            true
        }
    }

    /// Take the wake lock if the battery allows. Idempotent while held.
    pub async fn acquire(&self) {
        let mut held = self.held.lock().await;
        if *held {
            debug!("wake lock already held");
            return;
        }

        if !self.check_battery_level().await {
            info!("Skipping wake lock: battery low");
            self.bus.publish(EventKind::WakelockSkippedLowBattery);
            return;
        }

        match self.primitive.acquire(self.command_timeout()).await {
            Ok(()) => {
                *held = true;
                self.locked.store(true, Ordering::SeqCst);
                info!("Wake lock acquired");
                self.bus.publish(EventKind::WakelockAcquired);
            }
            Err(e) => {
                warn!("Failed to acquire wake lock: {}", e);
                self.bus
                    .publish(EventKind::WakelockAcquireFailed { error: e.to_string() });
            }
        }
    }

    /// Drop the wake lock. On failure the held flag is left as it was.
    pub async fn release(&self) {
        let mut held = self.held.lock().await;
        match self.primitive.release(self.command_timeout()).await {
            Ok(()) => {
                *held = false;
                self.locked.store(false, Ordering::SeqCst);
                info!("Wake lock released");
                self.bus.publish(EventKind::WakelockReleased);
            }
            Err(e) => {
                warn!("Failed to release wake lock: {}", e);
                self.bus
                    .publish(EventKind::WakelockReleaseFailed { error: e.to_string() });
            }
        }
    }

    /// Re-acquire every `wakelock.checkInterval` if the lock was lost
    pub fn start_monitoring(self: &Arc<Self>) -> Result<(), ScheduleError> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Err(ScheduleError::AlreadyRunning(TASK_NAME));
        }

        let interval_ms = self.config.get_or("wakelock.checkInterval", DEFAULT_INTERVAL_MS);
        if interval_ms < MIN_INTERVAL_MS {
            return Err(ScheduleError::IntervalTooShort {
                name: TASK_NAME,
                interval_ms,
            });
        }

        let manager = Arc::clone(self);
        *task = Some(PeriodicTask::spawn(
            TASK_NAME,
            Duration::from_millis(interval_ms),
            FirstTick::Delayed,
            move || {
                let manager = Arc::clone(&manager);
                async move {
                    if !manager.is_locked() {
                        manager.acquire().await;
                    }
                }
            },
        ));
        drop(task);

        info!("Wake lock monitoring started (every {}ms)", interval_ms);
        self.bus
            .publish(EventKind::WakelockMonitoringStarted { interval_ms });
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Stop monitoring, release a held lock and drop the battery subscription
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.stop().await;
        }

        if self.is_locked() {
            self.release().await;
        }

        let subscription = self
            .low_battery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = subscription {
            self.bus.unsubscribe(topics::BATTERY_LOW, &h);
        }

        info!("Wake lock manager stopped");
        self.bus.publish(EventKind::WakelockManagerStopped);
    }
}
