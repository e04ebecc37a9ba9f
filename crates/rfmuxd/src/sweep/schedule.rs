//! Cancellable timers that deliver messages to the sweep actor.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// A spawned timer. Dropping the handle aborts the timer.
///
/// A message already queued before the abort is still delivered, so
/// receivers tag messages and discard stale ones.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Sends `msg` once after `delay`.
    pub fn once<T>(delay: Duration, tx: mpsc::Sender<T>, msg: T) -> Self
    where
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(msg).await;
        });
        Self { handle }
    }

    /// Sends `make()` every `period`, first after one full period.
    ///
    /// Stops when the receiver is gone.
    pub fn repeating<T, F>(period: Duration, tx: mpsc::Sender<T>, mut make: F) -> Self
    where
        T: Send + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tx.send(make()).await.is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
