//! Timers owned by the objects that schedule them
//!
//! Every delayed or periodic callback in this crate runs as a [`Timer`]: a
//! spawned task whose handle aborts the task when dropped. Owners keep timers
//! in their state, so replacing or clearing the field cancels the callback
//! and nothing can fire into an object that has moved on.
//!
//! Time is read from [`tokio::time::Instant`], which tests can pause and
//! advance.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Handle to a cancellable scheduled task
#[derive(Debug)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Run a future as a cancellable task
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Run a future once after `delay`
    pub fn after<F>(delay: Duration, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(async move {
            sleep(delay).await;
            future.await;
        })
    }

    /// Call `tick` every `period`, first after one full period
    pub fn every<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        })
    }

    /// Abort the task if it has not finished
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Drop the handle without aborting
    ///
    /// Used by a timer's own task when it clears itself from its owner's
    /// state, since aborting the running task would cut it short.
    pub fn release(mut self) {
        self.handle.take();
    }

    /// Whether the task is still scheduled or running
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Time elapsed since `start`, zero if `start` is in the future
pub fn elapsed_since(start: Instant) -> Duration {
    Instant::now().saturating_duration_since(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _timer = Timer::after(Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = Timer::after(Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_active());
        drop(timer);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_ticks_after_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut timer = Timer::every(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(260)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        timer.cancel();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_since() {
        let start = Instant::now();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(elapsed_since(start), Duration::from_millis(1500));
    }
}
