//! Cancelable one-shot and periodic timers that post messages to the session.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// A spawned timer task. Dropping the handle cancels it.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Run `fire` once after `delay`.
    pub fn after<F, Fut>(delay: Duration, fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            fire().await;
        });
        Self { task }
    }

    /// Run `fire` every `period`, first after one full period.
    /// Stops when `fire` returns `false`.
    pub fn every<F, Fut>(period: Duration, mut fire: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !fire().await {
                    break;
                }
            }
        });
        Self { task }
    }

}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
