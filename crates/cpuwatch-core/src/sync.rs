//! Timed mutual exclusion and deadline waits.
//!
//! Every blocking call in the pipeline goes through one of these two
//! primitives, so every suspension point carries an explicit bound:
//!
//! - [`TimedLock::try_acquire`] gives up after a relative timeout.
//! - [`DeadlineSignal::wait_until`] gives up at an absolute deadline.
//!
//! Release is the guard's `Drop`. `wait_until` takes the guard itself, so
//! "the caller holds the lock" is enforced by the type system.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Guard returned by a successful [`TimedLock::try_acquire`].
pub type Guard<'a, T> = MutexGuard<'a, T>;

/// Lock acquisition failures.
///
/// The lock cannot be poisoned, so a timeout is the only failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("lock not acquired within {waited:?}")]
    TimedOut { waited: Duration },
}

/// A mutex whose acquire is bounded by a timeout.
#[derive(Debug, Default)]
pub struct TimedLock<T> {
    inner: Mutex<T>,
}

impl<T> TimedLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, waiting at most `timeout`.
    pub fn try_acquire(&self, timeout: Duration) -> Result<Guard<'_, T>, AcquireError> {
        let started = Instant::now();
        self.inner
            .try_lock_for(timeout)
            .ok_or_else(|| AcquireError::TimedOut {
                waited: started.elapsed(),
            })
    }
}

/// Result of a deadline wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// A condition signal with absolute-deadline waits.
///
/// A signal must only ever be waited on together with guards of one
/// [`TimedLock`].
#[derive(Debug, Default)]
pub struct DeadlineSignal {
    cv: Condvar,
}

impl DeadlineSignal {
    pub const fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    /// Atomically release the guard's lock, block until signalled or until
    /// `deadline`, then reacquire the lock before returning.
    ///
    /// A deadline already in the past returns [`WaitOutcome::TimedOut`]
    /// immediately. Spurious wakeups surface as `Signaled`; callers re-check
    /// their condition.
    pub fn wait_until<T>(&self, guard: &mut Guard<'_, T>, deadline: Instant) -> WaitOutcome {
        if self.cv.wait_until(guard, deadline).timed_out() {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Signaled
        }
    }

    /// Wake one waiter. Returns the number of waiters woken (0 or 1).
    pub fn signal_one(&self) -> usize {
        usize::from(self.cv.notify_one())
    }

    /// Wake every waiter. Returns the number of waiters woken.
    pub fn signal_all(&self) -> usize {
        self.cv.notify_all()
    }
}
