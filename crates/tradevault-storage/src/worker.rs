//! Background timer loops with explicit start/stop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Handle to a periodic background task.
///
/// The first tick fires one `period` after spawn, not immediately.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `tick` on the current tokio runtime every `period`.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(worker = name, period_ms = period.as_millis() as u64, "Worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!(worker = name, "Worker stopped");
        });

        Self {
            name,
            shutdown,
            task,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the worker and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` if the worker had to be abandoned.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let mut task = self.task;

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(worker = self.name, error = %e, "Worker ended abnormally");
                false
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    worker = self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time, abandoned"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_worker_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = WorkerHandle::spawn("ticker", Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.stop(Duration::from_secs(1)).await);
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_no_tick_before_first_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = WorkerHandle::spawn("slow", Duration::from_secs(3600), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.name(), "slow");
        assert!(handle.stop(Duration::from_secs(1)).await);
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stuck_worker_is_abandoned() {
        let handle = WorkerHandle::spawn("stuck", Duration::from_millis(5), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.stop(Duration::from_millis(20)).await);
    }
}
