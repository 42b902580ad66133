//! Producer/consumer protocol shared by every pipeline stage.
//!
//! Each stage runs one loop on its own thread:
//!
//! ```text
//!            ┌──────────────────────────────────────────────────────┐
//!            ▼                                                      │
//!   Running ──► heartbeat ──► cancelled? ──yes──► Exiting ──► Terminated
//!            │                    │no
//!            │                    ▼
//!            │   AcquiringLock ─► WaitingForData ─► pop ─► signal not_full
//!            │                    (deadline)                        │
//!            │   AcquiringLock ─► WaitingForSpace ─► push ─► signal not_empty
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! Lock timeouts and wait timeouts are retried on the next iteration and
//! never end the loop. Only cancellation does. Guards are scoped, so every
//! exit path releases the queue lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::bounded_queue::BoundedQueue;
use crate::cancel::CancellationToken;
use crate::handoff::{Consumer, Producer};
use crate::sync::{Guard, WaitOutcome};
use crate::watchdog::{Watchdog, WorkerId};

/// Setup failure: the log file could not be opened.
pub const SETUP_LOG_FILE_UNAVAILABLE: i32 = -3;

// =============================================================================
// State and outcome types
// =============================================================================

/// Where a stage currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Running,
    AcquiringLock,
    WaitingForData,
    WaitingForSpace,
    Exiting,
    Terminated,
}

/// Per-stage counters, reported in the exit summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub iterations: u64,
    pub consumed: u64,
    pub produced: u64,
    pub lock_timeouts: u64,
    pub wait_timeouts: u64,
    /// Items lost to forced writes or failed produces.
    pub dropped: u64,
    pub errors: u64,
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExitStatus {
    /// Observed cancellation and left its loop.
    Cancelled,
    /// Failed before entering its loop.
    SetupFailed { code: i32, reason: String },
    /// Watchdog only: detected `stalled` and cancelled the pipeline.
    Tripped { stalled: WorkerId },
}

impl ExitStatus {
    /// Numeric status: 0 on cancellation, negative on setup failure, stalled
    /// worker index + 1 after a trip.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Cancelled => 0,
            Self::SetupFailed { code, .. } => *code,
            Self::Tripped { stalled } => stalled.index() as i32 + 1,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::SetupFailed { code, reason } => write!(f, "setup failed ({code}): {reason}"),
            Self::Tripped { stalled } => write!(f, "tripped on {stalled}"),
        }
    }
}

/// What a worker thread returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    pub worker: WorkerId,
    #[serde(flatten)]
    pub status: ExitStatus,
    pub stats: StageStats,
}

impl WorkerExit {
    /// Exit for a worker whose setup failed; its loop never ran.
    pub fn setup_failed(worker: WorkerId, code: i32, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::error!(worker = %worker, code, reason = %reason, "Worker setup failed");
        Self {
            worker,
            status: ExitStatus::SetupFailed { code, reason },
            stats: StageStats::default(),
        }
    }
}

/// Result of one consume attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Consumed<T> {
    Item(T),
    /// Lock or wait timed out; nothing this cycle.
    NoData,
    Cancelled,
}

enum Gate<G> {
    Open(G),
    NoData,
    Cancelled,
}

/// Result of one produce attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Produced {
    Written,
    /// Written after the wait deadline by dropping the oldest queued item.
    Forced,
    /// Lock timed out; the item was discarded.
    Dropped,
    /// Cancellation observed; the item was not written.
    Cancelled,
}

// =============================================================================
// StageContext
// =============================================================================

/// Bounds on the two blocking calls of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub lock_timeout: Duration,
    pub wait_timeout: Duration,
}

impl Default for StageTiming {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(50),
            wait_timeout: Duration::from_millis(2000),
        }
    }
}

/// Everything a stage needs to follow the protocol: its identity, the shared
/// token and watchdog, and its running state and counters.
#[derive(Debug)]
pub struct StageContext {
    worker: WorkerId,
    token: CancellationToken,
    watchdog: Arc<Watchdog>,
    timing: StageTiming,
    state: StageState,
    stats: StageStats,
}

impl StageContext {
    pub fn new(
        worker: WorkerId,
        token: CancellationToken,
        watchdog: Arc<Watchdog>,
        timing: StageTiming,
    ) -> Self {
        info!(worker = %worker, "Worker started");
        Self {
            worker,
            token,
            watchdog,
            timing,
            state: StageState::Running,
            stats: StageStats::default(),
        }
    }

    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    #[must_use]
    pub fn state(&self) -> StageState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn timing(&self) -> StageTiming {
        self.timing
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn transition(&mut self, next: StageState) {
        if self.state != next {
            trace!(worker = %self.worker, from = ?self.state, to = ?next, "Stage transition");
            self.state = next;
        }
    }

    /// State change made while a queue guard is held. Emits no event: a
    /// subscriber write may need the log sink lock.
    fn enter_wait(&mut self, next: StageState) {
        self.state = next;
    }

    /// Start of every iteration: heartbeat first, then poll cancellation.
    ///
    /// Returns `false` when the stage must exit.
    pub fn begin_iteration(&mut self) -> bool {
        self.watchdog.report_active(self.worker);
        self.stats.iterations += 1;
        if self.token.is_cancelled() {
            self.transition(StageState::Exiting);
            return false;
        }
        self.transition(StageState::Running);
        true
    }

    /// Absolute deadline for one wait. Idle waits are capped at half the
    /// watchdog budget so a healthy idle stage keeps heartbeating in time.
    fn wait_deadline(&self) -> Instant {
        let cap = self.watchdog.budget() / 2;
        Instant::now() + self.timing.wait_timeout.min(cap)
    }

    /// Lock `input` and wait up to one deadline for it to become non-empty.
    ///
    /// `Open` carries the guard; the queue may still be empty if the
    /// deadline passed.
    fn open_input<'q, T>(&mut self, input: &'q Consumer<T>) -> Gate<Guard<'q, BoundedQueue<T>>> {
        self.transition(StageState::AcquiringLock);
        let mut queue = match input.lock(self.timing.lock_timeout) {
            Ok(queue) => queue,
            Err(err) => {
                self.stats.lock_timeouts += 1;
                warn!(worker = %self.worker, error = %err, "Input lock timed out, retrying");
                self.transition(StageState::Running);
                return Gate::NoData;
            }
        };

        self.enter_wait(StageState::WaitingForData);
        let deadline = self.wait_deadline();
        while queue.is_empty() && !self.token.is_cancelled() {
            if input.wait_for_data(&mut queue, deadline) == WaitOutcome::TimedOut {
                break;
            }
        }

        if self.token.is_cancelled() {
            drop(queue);
            self.transition(StageState::Exiting);
            return Gate::Cancelled;
        }
        Gate::Open(queue)
    }

    /// Pop one item from `input`, waiting up to one deadline for data.
    pub fn consume<T>(&mut self, input: &Consumer<T>) -> Consumed<T> {
        let mut queue = match self.open_input(input) {
            Gate::Open(queue) => queue,
            Gate::NoData => return Consumed::NoData,
            Gate::Cancelled => return Consumed::Cancelled,
        };
        let item = queue.read();
        drop(queue);
        self.transition(StageState::Running);
        match item {
            Some(item) => {
                input.notify_read();
                self.stats.consumed += 1;
                Consumed::Item(item)
            }
            None => {
                self.stats.wait_timeouts += 1;
                warn!(worker = %self.worker, "No data before deadline");
                Consumed::NoData
            }
        }
    }

    /// Move up to `max` items from `input` onto `out` under one lock hold.
    ///
    /// Yields the number of items moved. An idle deadline is routine for a
    /// batch consumer and is only logged at debug level.
    pub fn consume_batch<T>(
        &mut self,
        input: &Consumer<T>,
        out: &mut Vec<T>,
        max: usize,
    ) -> Consumed<usize> {
        let mut queue = match self.open_input(input) {
            Gate::Open(queue) => queue,
            Gate::NoData => return Consumed::NoData,
            Gate::Cancelled => return Consumed::Cancelled,
        };
        let moved = queue.read_many(out, max);
        drop(queue);
        self.transition(StageState::Running);
        if moved == 0 {
            self.stats.wait_timeouts += 1;
            debug!(worker = %self.worker, "No data before deadline");
            return Consumed::NoData;
        }
        input.notify_read();
        self.stats.consumed += moved as u64;
        Consumed::Item(moved)
    }

    /// Idle for `total`, heartbeating once per lock-timeout slice.
    ///
    /// Returns `true` when cancellation was observed.
    pub fn pause(&mut self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        let slice = self.timing.lock_timeout.max(Duration::from_millis(1));
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.token.is_cancelled();
            }
            self.watchdog.report_active(self.worker);
            let step = slice.min(deadline - now);
            if self.token.sleep(step, step) {
                return true;
            }
        }
    }

    /// Push `item` into `output`, waiting up to one deadline for space.
    ///
    /// Past the deadline with the queue still full the item is force-written,
    /// dropping the oldest queued item so the freshest data is kept.
    pub fn produce<T>(&mut self, output: &Producer<T>, item: T) -> Produced {
        self.transition(StageState::AcquiringLock);
        let mut queue = match output.lock(self.timing.lock_timeout) {
            Ok(queue) => queue,
            Err(err) => {
                self.stats.lock_timeouts += 1;
                self.stats.dropped += 1;
                warn!(worker = %self.worker, error = %err, "Output lock timed out, item dropped");
                self.transition(StageState::Running);
                return Produced::Dropped;
            }
        };

        self.enter_wait(StageState::WaitingForSpace);
        let deadline = self.wait_deadline();
        while queue.is_full() && !self.token.is_cancelled() {
            if output.wait_for_space(&mut queue, deadline) == WaitOutcome::TimedOut {
                break;
            }
        }

        if self.token.is_cancelled() {
            drop(queue);
            self.transition(StageState::Exiting);
            return Produced::Cancelled;
        }

        let evicted = queue.write(item);
        drop(queue);
        output.notify_written();
        self.stats.produced += 1;
        self.transition(StageState::Running);

        if evicted.is_some() {
            self.stats.wait_timeouts += 1;
            self.stats.dropped += 1;
            warn!(worker = %self.worker, "Output still full at deadline, dropped oldest item");
            Produced::Forced
        } else {
            Produced::Written
        }
    }

    /// Leave the loop: emit the final log line and hand back the exit record.
    pub fn finish(mut self) -> WorkerExit {
        self.transition(StageState::Exiting);
        // Last heartbeat also wakes the supervisor so it sees the cancellation.
        self.watchdog.report_active(self.worker);
        info!(
            worker = %self.worker,
            iterations = self.stats.iterations,
            consumed = self.stats.consumed,
            produced = self.stats.produced,
            dropped = self.stats.dropped,
            "Worker exiting"
        );
        self.transition(StageState::Terminated);
        debug!(worker = %self.worker, "Worker terminated");
        WorkerExit {
            worker: self.worker,
            status: ExitStatus::Cancelled,
            stats: self.stats,
        }
    }
}
