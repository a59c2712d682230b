//! Owned periodic background tasks.
//!
//! A [`WorkerHandle`] runs a tick function on a fixed interval until it is
//! stopped or dropped. Stopping goes through a `watch` channel so the loop
//! exits at its next await instead of being aborted mid-tick.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a running periodic worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawns `tick` every `interval`, first after one full interval.
    ///
    /// `tick` returning `false` ends the worker, which lets ticks holding a
    /// `Weak` reference stop once their owner is gone.
    #[must_use]
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let (stop, mut stopped) = watch::channel(false);
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !tick().await {
                            debug!(worker = name, "owner gone, worker exiting");
                            break;
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(worker = name, "worker stopped");
        });
        Self {
            name,
            stop,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the worker and waits for its loop to exit.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
