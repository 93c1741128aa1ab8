//! Periodic task with an explicit stop signal.
//!
//! Each supervision loop runs as one tokio task that awaits its pass to
//! completion before waiting for the next tick, so passes of the same loop
//! never overlap. Missed ticks are skipped rather than bunched up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

/// Shortest loop interval the monitor and wake lock manager accept
pub const MIN_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("{name} interval of {interval_ms}ms is below the {}ms minimum", MIN_INTERVAL_MS)]
    IntervalTooShort { name: &'static str, interval_ms: u64 },
}

/// Whether the first pass runs immediately or after one period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    Immediate,
    Delayed,
}

pub struct PeriodicTask {
    name: &'static str,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `pass` every `period` until [`PeriodicTask::stop`] is called
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        first: FirstTick,
        mut pass: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            let mut ticker = match first {
                FirstTick::Immediate => time::interval(period),
                FirstTick::Delayed => time::interval_at(time::Instant::now() + period, period),
            };
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = ticker.tick() => {
                        debug!("{}: pass", name);
                        pass().await;
                    }
                }
            }
            debug!("{}: loop exited", name);
        });

        Self { name, stop, handle }
    }

    /// Signal the loop and wait for any in-flight pass to finish
    pub async fn stop(self) {
        // notify_one stores a permit, so a stop issued mid-pass is not lost
        self.stop.notify_one();
        if let Err(e) = self.handle.await {
            warn!("{} task ended abnormally: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_immediate_then_periodic() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let period = Duration::from_secs(10);
        let task = PeriodicTask::spawn("test", period, FirstTick::Immediate, move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_first_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let period = Duration::from_secs(10);
        let task = PeriodicTask::spawn("test", period, FirstTick::Delayed, move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_do_not_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (a, m) = (Arc::clone(&active), Arc::clone(&max_seen));

        let period = Duration::from_secs(1);
        let task = PeriodicTask::spawn("slow", period, FirstTick::Immediate, move || {
            let (a, m) = (Arc::clone(&a), Arc::clone(&m));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                // Longer than the period
                tokio::time::sleep(Duration::from_secs(3)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(20)).await;
        task.stop().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
