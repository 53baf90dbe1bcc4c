//! Idle accounting and the idle-shutdown watchdog.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Timestamp of the most recent request or watcher batch. The lock guards
/// a single `Instant` and is never held across a suspension point.
#[derive(Debug)]
pub struct ActivityTracker {
    last: Mutex<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last: Mutex::new(Instant::now()),
        })
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

/// Fires the shutdown token once `idle >= timeout`. A zero timeout
/// disables the watchdog entirely.
pub struct IdleWatchdog {
    activity: Arc<ActivityTracker>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl IdleWatchdog {
    pub fn new(
        activity: Arc<ActivityTracker>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            activity,
            timeout,
            shutdown,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        if self.timeout.is_zero() {
            debug!("idle watchdog disabled");
            return;
        }

        let check_every = self.timeout.min(Duration::from_secs(60));
        let mut ticker = interval(check_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            timeout_secs = self.timeout.as_secs(),
            check_secs = check_every.as_secs(),
            "idle watchdog started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let idle = self.activity.idle();
                    if idle >= self.timeout {
                        info!(idle_secs = idle.as_secs(), "idle timeout reached, shutting down");
                        self.shutdown.cancel();
                        return;
                    }
                    debug!(idle_secs = idle.as_secs(), "idle check");
                }
            }
        }
    }
}
