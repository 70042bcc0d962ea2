//! Shutdown signalling for background threads.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A one-shot signal background threads poll between ticks.
///
/// Threads sleep on the condvar with a timeout instead of a plain sleep so
/// `Db::close` can interrupt a long tick interval immediately.
pub(crate) struct Shutdown {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal shutdown and wake every waiter.
    pub fn signal(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    /// Sleep up to `timeout` or until signalled.
    ///
    /// Returns `true` if shutdown has been signalled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if *flag {
            return true;
        }
        self.cond.wait_for(&mut flag, timeout);
        *flag
    }
}
