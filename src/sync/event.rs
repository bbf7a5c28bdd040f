use core::sync::atomic::{AtomicBool, Ordering};
use spin::relax::RelaxStrategy;
use spin::Mutex;

use crate::memory::status::{Error, Result, INTR_KILLED, INTR_RETRY};

/// Interruption state of a thread that may block in [`Event::wait`].
///
/// Whoever controls thread lifetime (the process layer, a debugger, a test)
/// flips these; a blocked waiter polls them between relax rounds.
#[derive(Debug, Default)]
pub struct ThreadSignals {
    killed: AtomicBool,
    suspended: AtomicBool,
}

impl ThreadSignals {
    pub const fn new() -> ThreadSignals {
        ThreadSignals {
            killed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

/// Auto-resetting event carrying the status it was signaled with.
///
/// Signaling an already signaled event replaces the pending status, so a
/// failure that lands after an early-wake success is what the waiter sees.
#[derive(Debug)]
pub struct Event {
    status: Mutex<Option<Result<()>>>,
}

impl Event {
    pub const fn new() -> Event {
        Event {
            status: Mutex::new(None),
        }
    }

    pub fn signal(&self, status: Result<()>) {
        *self.status.lock() = Some(status);
    }

    pub fn unsignal(&self) {
        *self.status.lock() = None;
    }

    pub fn is_signaled(&self) -> bool {
        self.status.lock().is_some()
    }

    /// Consume the pending status, if any. Consuming resets the event.
    pub fn try_take(&self) -> Option<Result<()>> {
        self.status.lock().take()
    }

    /// Block until signaled or interrupted.
    ///
    /// Returns the signaled status, `INTR_KILLED` once `signals` reports the
    /// thread killed, and `INTR_RETRY` if the thread is suspended while
    /// `suspendable`. A suspended waiter that is not suspendable keeps
    /// waiting: it may be running on behalf of kernel code that cannot unwind.
    pub fn wait<R: RelaxStrategy>(&self, signals: &ThreadSignals, suspendable: bool) -> Result<()> {
        loop {
            if let Some(status) = self.try_take() {
                return status;
            }
            if signals.is_killed() {
                return Err(Error::new(INTR_KILLED));
            }
            if suspendable && signals.is_suspended() {
                return Err(Error::new(INTR_RETRY));
            }
            R::relax();
        }
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}
