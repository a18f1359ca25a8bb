//! A latch background threads sleep on between rounds.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Trips the latch and wakes every waiter. Returns false if it was
    /// already tripped.
    pub(crate) fn stop(&self) -> bool {
        let was_stopped = std::mem::replace(&mut *self.lock(), true);
        self.wake.notify_all();
        !was_stopped
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.lock()
    }

    /// Sleeps for `period` or until stopped. Returns true if stopped.
    pub(crate) fn wait_timeout(&self, period: Duration) -> bool {
        let (stopped, _) = self
            .wake
            .wait_timeout_while(self.lock(), period, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }

    /// Blocks until stopped.
    pub(crate) fn wait(&self) {
        let _stopped = self
            .wake
            .wait_while(self.lock(), |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
    }

    // A bool cannot be left half-written.
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
