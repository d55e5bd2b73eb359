//! Periodic expiry sweeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chatterlink_shared::Clock;

use crate::error::Result;

/// A component holding entries that expire.
pub trait Sweepable: Send + Sync + 'static {
    /// Drop every entry expired at `now`. Returns how many were dropped.
    fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Background sweep task. Stops when stopped explicitly or dropped.
#[derive(Debug)]
pub struct SweepHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sweep `target` every `interval`. Failures are logged and the next tick
/// runs as usual.
pub fn spawn_sweeper(
    name: &'static str,
    interval: Duration,
    clock: Arc<dyn Clock>,
    target: Arc<dyn Sweepable>,
) -> SweepHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match target.sweep(clock.now()) {
                Ok(0) => {}
                Ok(removed) => debug!(sweeper = name, removed, "Expired entries swept"),
                Err(e) => warn!(sweeper = name, error = %e, "Sweep failed"),
            }
        }
    });
    SweepHandle { name, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use chatterlink_shared::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    impl Sweepable for Counter {
        fn sweep(&self, _now: DateTime<Utc>) -> Result<usize> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(CoreError::NotInitialized("counter"));
            }
            Ok(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_keeps_running_after_failure() {
        let counter = Arc::new(Counter::default());
        let handle = spawn_sweeper(
            "counter",
            Duration::from_secs(60),
            Arc::new(ManualClock::default()),
            counter.clone(),
        );
        assert_eq!(handle.name(), "counter");

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 3);

        handle.stop();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 3);
    }
}
