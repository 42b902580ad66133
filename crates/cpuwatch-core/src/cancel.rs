//! Pipeline-wide cooperative cancellation ("kill switch").
//!
//! One flag, shared by every worker, monotonic `false -> true`. Nothing ever
//! resets it. Workers poll it once per loop iteration and after every
//! bounded wait. The first recorded cause is kept for the exit summary.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::watchdog::WorkerId;

/// Why the pipeline was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "worker")]
pub enum CancelCause {
    /// SIGINT or SIGTERM.
    Signal,
    /// The watchdog saw this worker silent for longer than its budget.
    Unresponsive(WorkerId),
    /// Programmatic cancellation.
    Requested,
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Unresponsive(worker) => write!(f, "unresponsive worker: {worker}"),
            Self::Requested => write!(f, "requested"),
        }
    }
}

/// Shared cancellation flag. Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    cause: Arc<OnceLock<CancelCause>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` when this call recorded the first cause.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        // A signal handler sets the flag without recording a cause.
        if self.flag.load(Ordering::SeqCst) {
            let _ = self.cause.set(CancelCause::Signal);
        }
        let first = self.cause.set(cause).is_ok();
        self.flag.store(true, Ordering::SeqCst);
        first
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// First cause of cancellation, `None` while the flag is unset.
    #[must_use]
    pub fn cause(&self) -> Option<CancelCause> {
        if !self.is_cancelled() {
            return None;
        }
        Some(self.cause.get().copied().unwrap_or(CancelCause::Signal))
    }

    /// Sleep for `total`, waking every `slice` to poll the flag.
    ///
    /// Returns `true` when cancellation was observed.
    pub fn sleep(&self, total: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + total;
        let slice = slice.max(Duration::from_millis(1));
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

/// Route SIGINT and SIGTERM to `token`.
///
/// The handlers only store into the flag; the cause reads as
/// [`CancelCause::Signal`].
pub fn install_signal_handlers(token: &CancellationToken) -> io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&token.flag))?;
    }
    tracing::debug!("signal handlers installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.cause(), None);
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(other.cancel(CancelCause::Requested));
        assert!(token.is_cancelled());
        assert_eq!(token.cause(), Some(CancelCause::Requested));
    }

    #[test]
    fn first_cause_wins() {
        let token = CancellationToken::new();
        assert!(token.cancel(CancelCause::Unresponsive(WorkerId::Renderer)));
        assert!(!token.cancel(CancelCause::Requested));
        assert_eq!(
            token.cause(),
            Some(CancelCause::Unresponsive(WorkerId::Renderer))
        );
    }

    #[test]
    fn raw_flag_reads_as_signal() {
        let token = CancellationToken::new();
        token.flag.store(true, Ordering::SeqCst);
        assert_eq!(token.cause(), Some(CancelCause::Signal));

        // A later cancel does not overwrite the earlier signal.
        assert!(!token.cancel(CancelCause::Unresponsive(WorkerId::Sampler)));
        assert_eq!(token.cause(), Some(CancelCause::Signal));
    }

    #[test]
    fn sleep_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let other = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            other.cancel(CancelCause::Requested);
        });
        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(10), Duration::from_millis(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn sleep_runs_full_duration_when_not_cancelled() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_millis(30), Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cause_serializes_with_worker() {
        let json = serde_json::to_string(&CancelCause::Unresponsive(WorkerId::Logger)).unwrap();
        assert_eq!(json, r#"{"kind":"unresponsive","worker":"logger"}"#);
        let json = serde_json::to_string(&CancelCause::Signal).unwrap();
        assert_eq!(json, r#"{"kind":"signal"}"#);
    }
}
