//! Single-flight turn countdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Slot {
    /// Bumped on every start; a countdown only acts while it matches.
    generation: u64,
    running: Option<AbortHandle>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A countdown with at most one active run.
///
/// Starting always stops the previous run first. Stopping is idempotent.
/// The timeout callback fires at most once per run and never after
/// [`stop`](Self::stop) returned.
#[derive(Debug)]
pub struct TurnTimer {
    period: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl TurnTimer {
    /// Creates a stopped timer that ticks every `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// The tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Starts counting down from `ticks`.
    ///
    /// `on_tick` receives the number of ticks left after each period,
    /// down to and including 0. `on_timeout` runs right after the tick
    /// that reached 0. Must be called from within a Tokio runtime.
    pub fn start<T, O>(&self, ticks: u32, mut on_tick: T, on_timeout: O)
    where
        T: FnMut(u32) + Send + 'static,
        O: FnOnce() + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some(previous) = slot.running.take() {
            previous.abort();
            debug!("turn timer restarted");
        }
        slot.generation += 1;
        let generation = slot.generation;
        let shared = Arc::clone(&self.slot);
        let period = self.period;

        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            let mut left = ticks;
            while left > 0 {
                ticker.tick().await;
                left -= 1;
                {
                    let slot = lock(&shared);
                    if slot.generation != generation || slot.running.is_none() {
                        return;
                    }
                }
                trace!(left, "turn timer tick");
                on_tick(left);
            }

            // Claim the slot before firing so a racing stop() wins cleanly.
            {
                let mut slot = lock(&shared);
                if slot.generation != generation || slot.running.is_none() {
                    return;
                }
                slot.running = None;
            }
            debug!("turn timer expired");
            on_timeout();
        });

        // The task cannot observe the slot until this guard is released.
        slot.running = Some(task.abort_handle());
    }

    /// Stops the current run. Returns whether one was running.
    pub fn stop(&self) -> bool {
        match lock(&self.slot).running.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a countdown is in progress.
    pub fn is_running(&self) -> bool {
        lock(&self.slot).running.is_some()
    }
}

impl Drop for TurnTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
