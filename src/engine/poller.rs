//! Cancellable repeating task used for status polling.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Runs `tick` every `period` until it returns `Break` or the task is cancelled.
///
/// Ticks never overlap: the next one is only scheduled after the previous future
/// resolves, so a slow round-trip delays the cycle instead of stacking requests.
pub(crate) struct PollTask {
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollTask {
    pub(crate) fn start<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled2 = cancelled.clone();
        let handle = tokio::spawn(async move {
            // First request goes out one period after start, like a plain interval timer.
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut attempt = 0u64;
            loop {
                ticker.tick().await;
                if cancelled2.load(Ordering::Relaxed) {
                    break;
                }
                attempt += 1;
                if tick(attempt).await.is_break() {
                    break;
                }
            }
        });
        Self {
            cancelled,
            handle: Some(handle),
        }
    }

    /// Stop the cycle. Safe to call any number of times, including after the task ended.
    pub(crate) fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // Dropping a JoinHandle does not stop the task; abort it so an in-flight
            // request is dropped with it.
            handle.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
