//! Restartable single-shot countdown.
//!
//! A [`Countdown`] is armed, waits `period`, and delivers exactly one elapsed
//! notification for that arm cycle. It never repeats on its own: the owner
//! re-arms it explicitly. Each arm cycle is stamped with a generation number
//! and the owner claims a notification with [`Countdown::take_elapsed`], which
//! rejects notifications from cycles that were disarmed in the meantime.
//!
//! The countdown itself holds no lock; it is meant to live inside state that
//! is already guarded by the owner's mutex.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

struct Armed {
    generation: u64,
    task: AbortHandle,
}

/// Single-shot countdown backed by a spawned `tokio::time::sleep`.
pub struct Countdown {
    period: Duration,
    runtime: Handle,
    generation: u64,
    armed: Option<Armed>,
}

impl Countdown {
    pub fn new(period: Duration, runtime: Handle) -> Self {
        Self {
            period,
            runtime,
            generation: 0,
            armed: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Start a new arm cycle.
    ///
    /// `on_elapsed` runs on the runtime after `period` with the cycle's
    /// generation. Returns `false` without doing anything if already armed.
    pub fn arm<F>(&mut self, on_elapsed: F) -> bool
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.armed.is_some() {
            return false;
        }
        self.generation += 1;
        let generation = self.generation;
        let period = self.period;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(period).await;
            on_elapsed(generation);
        });
        self.armed = Some(Armed {
            generation,
            task: task.abort_handle(),
        });
        true
    }

    /// Stop the current cycle, if any. Its notification will not be delivered,
    /// or will be rejected by `take_elapsed` if it is already running.
    pub fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.task.abort();
        }
    }

    /// Claim the elapsed notification for `generation`.
    ///
    /// Returns `true` (and leaves the countdown unarmed) only when `generation`
    /// is the live arm cycle.
    pub fn take_elapsed(&mut self, generation: u64) -> bool {
        match &self.armed {
            Some(armed) if armed.generation == generation => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for Countdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Countdown")
            .field("period", &self.period)
            .field("generation", &self.generation)
            .field("armed", &self.is_armed())
            .finish()
    }
}
