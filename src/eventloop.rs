//! Event-loop delayed-callback facility (`spec.md` §9 "Concurrency primitive":
//! "Do not spin or sleep; use the event loop's delayed-callback facility
//! for the post-commit sweep and the periodic Janitor"). A thin wrapper
//! over `tokio::spawn`/`tokio::time`, matching the async-task style the
//! teacher crate uses for its own background work.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Schedules work against the single cooperative event loop the core
/// assumes (`spec.md` §5 "Scheduling model").
#[derive(Clone, Default)]
pub struct EventLoop;

impl EventLoop {
    pub fn new() -> Self {
        Self
    }

    /// Run `callback` once, after `delay` has elapsed, on this loop.
    /// Used for the post-commit channel sweep (`spec.md` §4.4).
    pub fn schedule_delayed<F>(&self, delay: Duration, callback: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback.await;
        })
    }

    /// Run `callback` repeatedly every `interval`, until the handle is
    /// dropped or aborted. Used for the Session Janitor (`spec.md` §4.6).
    pub fn schedule_periodic<F, Fut>(&self, interval: Duration, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                callback().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn schedule_delayed_runs_after_the_delay() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let handle = event_loop.schedule_delayed(Duration::from_millis(50), async move {
            ran_clone.store(true, Ordering::SeqCst);
        });
        tokio::time::advance(Duration::from_millis(60)).await;
        handle.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
