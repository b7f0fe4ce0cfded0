//! Cooperative cancellation for the background worker.
//!
//! A single flag plus condition variable: `deactivate` (or the manager's
//! release path) raises the flag and wakes the worker; every cooperative
//! sleep in the worker, the retry engine and the frequency detector returns
//! [`DrmError::Exit`] as soon as the flag is observed.

use crate::error::{DrmError, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) struct StopSignal {
    requested: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            requested: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Raise the stop flag and wake every sleeper.
    pub fn request_stop(&self) {
        *self.requested.lock() = true;
        self.condvar.notify_all();
    }

    /// Lower the stop flag so a future worker can run.
    pub fn reset(&self) {
        *self.requested.lock() = false;
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.lock()
    }

    /// Sleep for `duration`, returning early with [`DrmError::Exit`] if the
    /// stop flag is raised before the time elapses.
    pub fn sleep_or_exit(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut requested = self.requested.lock();
        loop {
            if *requested {
                return Err(DrmError::Exit("exit requested".to_string()));
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            self.condvar.wait_until(&mut requested, deadline);
        }
    }
}
