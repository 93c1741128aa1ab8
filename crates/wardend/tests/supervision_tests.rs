//! Supervision behaviour tests
//!
//! Drive the health checker, service monitor and wake lock manager through
//! the bus with fake collaborators. Only the TCP probe touches the network,
//! and only on 127.0.0.1.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warden_common::{topics, EventKind, WardenEvent, MAX_RETRIES_EXCEEDED};
use wardend::battery::{BatterySource, FakeBattery};
use wardend::health::HealthChecker;
use wardend::monitor::ServiceMonitor;
use wardend::supervisor::{
    FakeSupervisor, ProcessSupervisor, SupervisorError, SupervisorStatus,
};
use wardend::wakelock::{FakeWakeLock, WakeLockPrimitive, WakelockManager};
use wardend::{handler, ConfigStore, EventBus};

// ============================================================================
// Helpers
// ============================================================================

/// Every event published on the bus, in order
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<WardenEvent>>>,
}

impl Recorder {
    fn attach(bus: &EventBus) -> Self {
        let recorder = Self::default();
        for topic in topics::ALL {
            let events = Arc::clone(&recorder.events);
            bus.subscribe(
                topic,
                handler(move |event| {
                    events.lock().unwrap().push(event.clone());
                    Ok(())
                }),
            );
        }
        recorder
    }

    fn topics(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.topic()).collect()
    }

    fn of(&self, topic: &str) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.topic() == topic)
            .map(|e| e.kind.clone())
            .collect()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

fn store(overrides: Value) -> Arc<ConfigStore> {
    Arc::new(ConfigStore::from_value(overrides).unwrap())
}

fn monitor_with(
    overrides: Value,
    supervisor: Arc<dyn ProcessSupervisor>,
) -> (Arc<ServiceMonitor>, Recorder) {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::attach(&bus);
    let monitor = Arc::new(ServiceMonitor::new(bus, store(overrides), supervisor));
    (monitor, recorder)
}

fn wakelock_with(
    overrides: Value,
    level: u8,
) -> (Arc<EventBus>, Arc<WakelockManager>, Arc<FakeWakeLock>, Arc<FakeBattery>, Recorder) {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::attach(&bus);
    let lock = Arc::new(FakeWakeLock::new());
    let battery = Arc::new(FakeBattery::new(level));
    let manager = WakelockManager::new(
        Arc::clone(&bus),
        store(overrides),
        Arc::clone(&lock) as Arc<dyn WakeLockPrimitive>,
        Arc::clone(&battery) as Arc<dyn BatterySource>,
    );
    (bus, manager, lock, battery, recorder)
}

async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ============================================================================
// Health checker
// ============================================================================

/// One healthy TCP check publishes ok then completed, nothing else
#[tokio::test]
async fn test_single_healthy_tcp_check() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::attach(&bus);
    let checker = HealthChecker::new(
        bus,
        store(json!({
            "healthCheck": {
                "checks": [{ "name": "SSH", "port": port, "type": "tcp", "host": "127.0.0.1" }]
            }
        })),
    );

    let results = checker.run_checks().await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "SSH");
    assert!(results[0].healthy);
    assert_eq!(
        recorder.topics(),
        vec![topics::SERVICE_HEALTH_OK, topics::HEALTH_CHECK_COMPLETED]
    );
}

/// Checks are evaluated and published in configuration order
#[tokio::test]
async fn test_checks_follow_configuration_order() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::attach(&bus);
    let checker = HealthChecker::new(
        bus,
        store(json!({
            "healthCheck": {
                "checks": [
                    { "name": "broken", "port": 1 },
                    { "name": "up", "port": port, "type": "tcp", "host": "127.0.0.1" },
                    { "name": "dns", "port": 53, "type": "udp" }
                ]
            }
        })),
    );

    let results = checker.run_checks().await;
    let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["broken", "up", "dns"]);
    assert_eq!(
        results[0].error.as_deref(),
        Some("incomplete check configuration")
    );
    assert_eq!(
        recorder.topics(),
        vec![
            topics::SERVICE_HEALTH_FAILED,
            topics::SERVICE_HEALTH_OK,
            topics::SERVICE_HEALTH_FAILED,
            topics::HEALTH_CHECK_COMPLETED,
        ]
    );
}

#[tokio::test]
async fn test_malformed_check_list_publishes_error() {
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::attach(&bus);
    let checker = HealthChecker::new(bus, store(json!({ "healthCheck": { "checks": {} } })));

    assert!(checker.run_checks().await.is_empty());
    assert_eq!(recorder.topics(), vec![topics::HEALTH_CHECK_ERROR]);
}

// ============================================================================
// Service monitor
// ============================================================================

/// Three failed restarts exhaust a budget of three; the fourth runs nothing
#[tokio::test]
async fn test_restart_budget_exhausted() {
    let fake = Arc::new(FakeSupervisor::new());
    fake.push_restart("sshd", Err("pm2 exited 1"));
    let (monitor, recorder) = monitor_with(
        json!({ "serviceMonitor": { "maxRetries": 3 } }),
        Arc::clone(&fake) as Arc<dyn ProcessSupervisor>,
    );

    for _ in 0..3 {
        monitor.restart_service("sshd").await;
    }
    assert_eq!(fake.restart_calls().len(), 3);
    recorder.clear();

    monitor.restart_service("sshd").await;

    assert_eq!(fake.restart_calls().len(), 3);
    assert_eq!(monitor.attempts("sshd"), 3);
    match recorder.of(topics::SERVICE_RESTART_FAILED).as_slice() {
        [EventKind::ServiceRestartFailed {
            service,
            reason,
            max_retries,
            ..
        }] => {
            assert_eq!(service, "sshd");
            assert_eq!(reason, MAX_RETRIES_EXCEEDED);
            assert_eq!(*max_retries, Some(3));
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert!(recorder.of(topics::SERVICE_RESTART_STARTED).is_empty());
}

/// Attempts never exceed maxRetries across repeated monitoring passes
#[tokio::test]
async fn test_attempts_capped_over_passes() {
    let fake = Arc::new(FakeSupervisor::new());
    fake.push_status("web", Ok(SupervisorStatus::Offline));
    fake.push_restart("web", Err("still broken"));
    let (monitor, _recorder) = monitor_with(
        json!({ "serviceMonitor": { "services": ["web"], "maxRetries": 2 } }),
        Arc::clone(&fake) as Arc<dyn ProcessSupervisor>,
    );

    for _ in 0..6 {
        monitor.monitor().await;
        assert!(monitor.attempts("web") <= 2);
    }
    assert_eq!(fake.restart_calls().len(), 2);
}

/// A running observation resets an exhausted service
#[tokio::test]
async fn test_running_resets_attempts() {
    let fake = Arc::new(FakeSupervisor::new());
    fake.push_status("sshd", Ok(SupervisorStatus::Offline));
    fake.push_status("sshd", Ok(SupervisorStatus::Offline));
    fake.push_status("sshd", Ok(SupervisorStatus::Online));
    fake.push_restart("sshd", Err("exit 1"));
    let (monitor, recorder) = monitor_with(
        json!({ "serviceMonitor": { "services": ["sshd"], "maxRetries": 2 } }),
        Arc::clone(&fake) as Arc<dyn ProcessSupervisor>,
    );

    monitor.monitor().await;
    monitor.monitor().await;
    assert_eq!(monitor.attempts("sshd"), 2);

    monitor.monitor().await;
    assert_eq!(monitor.attempts("sshd"), 0);
    assert_eq!(recorder.of(topics::SERVICE_RUNNING).len(), 1);
}

/// A status query that errors counts as stopped and triggers a restart
#[tokio::test]
async fn test_query_error_triggers_restart() {
    let fake = Arc::new(FakeSupervisor::new());
    fake.push_status("sshd", Err("pm2: command not found"));
    let (monitor, recorder) = monitor_with(
        json!({ "serviceMonitor": { "services": ["sshd"] } }),
        Arc::clone(&fake) as Arc<dyn ProcessSupervisor>,
    );

    monitor.monitor().await;

    assert_eq!(fake.restart_calls(), vec!["sshd"]);
    assert_eq!(
        recorder.topics(),
        vec![
            topics::SERVICE_MONITOR_STARTED,
            topics::SERVICE_RESTART_STARTED,
            topics::SERVICE_RESTART_COMPLETED,
            topics::SERVICE_MONITOR_COMPLETED,
        ]
    );
}

/// Supervisor that panics for one service
struct FaultySupervisor;

#[async_trait]
impl ProcessSupervisor for FaultySupervisor {
    async fn status(
        &self,
        service: &str,
        _timeout: Duration,
    ) -> Result<SupervisorStatus, SupervisorError> {
        if service == "crashy" {
            panic!("supervisor client bug");
        }
        Ok(SupervisorStatus::Online)
    }

    async fn restart(&self, _service: &str, _timeout: Duration) -> Result<(), SupervisorError> {
        Ok(())
    }
}

/// One faulting service does not stop the pass
#[tokio::test]
async fn test_faulting_service_does_not_abort_pass() {
    let (monitor, recorder) = monitor_with(
        json!({ "serviceMonitor": { "services": ["sshd", "crashy", "webserver"] } }),
        Arc::new(FaultySupervisor),
    );

    monitor.monitor().await;

    let running: Vec<_> = recorder
        .of(topics::SERVICE_RUNNING)
        .into_iter()
        .filter_map(|k| match k {
            EventKind::ServiceRunning { service } => Some(service),
            _ => None,
        })
        .collect();
    assert_eq!(running, vec!["sshd", "webserver"]);

    match recorder.of(topics::SERVICE_MONITOR_ERROR).as_slice() {
        [EventKind::ServiceMonitorError { service, .. }] => {
            assert_eq!(service.as_deref(), Some("crashy"));
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(recorder.of(topics::SERVICE_MONITOR_COMPLETED).len(), 1);
}

/// Unsafe names never reach the supervisor
#[tokio::test]
async fn test_unsafe_service_name_is_not_executed() {
    let fake = Arc::new(FakeSupervisor::new());
    let (monitor, recorder) = monitor_with(
        json!({ "serviceMonitor": { "services": ["sshd; rm -rf /"] } }),
        Arc::clone(&fake) as Arc<dyn ProcessSupervisor>,
    );

    monitor.monitor().await;

    assert!(fake.status_calls().is_empty());
    assert!(fake.restart_calls().is_empty());
    assert_eq!(recorder.of(topics::SERVICE_MONITOR_ERROR).len(), 1);
}

// ============================================================================
// Wake lock manager
// ============================================================================

/// Low battery skips the lock without touching the primitive
#[tokio::test]
async fn test_low_battery_skips_lock() {
    let (_bus, manager, lock, _battery, recorder) = wakelock_with(
        json!({ "wakelock": { "enableBatteryCheck": true, "minBatteryLevel": 20 } }),
        10,
    );

    manager.acquire().await;

    assert_eq!(lock.acquire_calls(), 0);
    assert!(!manager.is_locked());
    assert_eq!(
        recorder.topics(),
        vec![topics::BATTERY_LOW, topics::WAKELOCK_SKIPPED_LOW_BATTERY]
    );
}

/// An unreadable battery allows the lock
#[tokio::test]
async fn test_battery_failure_allows_lock() {
    let (_bus, manager, lock, battery, recorder) = wakelock_with(json!({}), 50);
    battery.set_error("termux-battery-status: command not found");

    assert!(manager.check_battery_level().await);
    assert!(recorder.topics().is_empty());

    manager.acquire().await;
    assert_eq!(lock.acquire_calls(), 1);
    assert_eq!(recorder.topics(), vec![topics::WAKELOCK_ACQUIRED]);
}

#[tokio::test]
async fn test_double_acquire_single_primitive_call() {
    let (_bus, manager, lock, _battery, _recorder) = wakelock_with(json!({}), 90);

    manager.acquire().await;
    manager.acquire().await;

    assert_eq!(lock.acquire_calls(), 1);
    assert!(manager.is_locked());
}

/// Concurrent acquires still take the lock once
#[tokio::test]
async fn test_concurrent_acquire_single_primitive_call() {
    let (_bus, manager, lock, _battery, _recorder) = wakelock_with(json!({}), 90);

    let (a, b) = (Arc::clone(&manager), Arc::clone(&manager));
    tokio::join!(a.acquire(), b.acquire());

    assert_eq!(lock.acquire_calls(), 1);
}

/// A battery-low event from anywhere releases a held lock
#[tokio::test]
async fn test_published_battery_low_releases_lock() {
    let (bus, manager, lock, _battery, recorder) = wakelock_with(json!({}), 90);
    manager.acquire().await;
    assert!(manager.is_locked());

    bus.publish(EventKind::BatteryLow {
        level: 8,
        threshold: 20,
    });

    assert!(eventually(|| !manager.is_locked()).await);
    assert_eq!(lock.release_calls(), 1);
    assert_eq!(recorder.of(topics::WAKELOCK_RELEASED).len(), 1);
}

#[tokio::test]
async fn test_battery_low_keeps_lock_without_auto_release() {
    let (bus, manager, lock, _battery, _recorder) =
        wakelock_with(json!({ "wakelock": { "autoReleaseOnLowBattery": false } }), 90);
    manager.acquire().await;

    bus.publish(EventKind::BatteryLow {
        level: 8,
        threshold: 20,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.is_locked());
    assert_eq!(lock.release_calls(), 0);
}

#[tokio::test]
async fn test_failed_release_keeps_lock_held() {
    let (_bus, manager, lock, _battery, recorder) = wakelock_with(json!({}), 90);
    manager.acquire().await;
    lock.fail_release(true);

    manager.release().await;

    assert!(manager.is_locked());
    assert_eq!(recorder.of(topics::WAKELOCK_RELEASE_FAILED).len(), 1);
    assert!(recorder.of(topics::WAKELOCK_RELEASED).is_empty());
}

#[tokio::test]
async fn test_monitoring_refuses_short_interval() {
    let (_bus, manager, _lock, _battery, recorder) =
        wakelock_with(json!({ "wakelock": { "checkInterval": 999 } }), 90);

    assert!(manager.start_monitoring().is_err());
    assert!(!manager.is_monitoring());
    assert!(recorder.of(topics::WAKELOCK_MONITORING_STARTED).is_empty());
}

/// The monitoring loop re-takes a lock that was lost
#[tokio::test(start_paused = true)]
async fn test_monitoring_reacquires_lost_lock() {
    let (_bus, manager, lock, _battery, _recorder) =
        wakelock_with(json!({ "wakelock": { "checkInterval": 1000 } }), 90);
    manager.acquire().await;
    manager.release().await;
    assert!(!manager.is_locked());

    manager.start_monitoring().unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(manager.is_locked());
    assert_eq!(lock.acquire_calls(), 2);

    // Held now, so further ticks leave the primitive alone
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(lock.acquire_calls(), 2);

    manager.stop().await;
}
