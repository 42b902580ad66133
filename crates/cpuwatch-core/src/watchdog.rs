//! Liveness watchdog for the worker pipeline.
//!
//! Every worker stamps its heartbeat on every loop iteration. The supervisor
//! loop sleeps until the stalest heartbeat would exceed the budget (or until
//! any heartbeat arrives), then re-checks. When a worker has been silent for
//! longer than the budget it raises the shared [`CancellationToken`] and
//! exits. It never kills a worker; shutdown stays cooperative.
//!
//! # Integration
//!
//! ```text
//! Pipeline
//!   ├── sampler  ──► watchdog.report_active(Sampler)
//!   ├── analyzer ──► watchdog.report_active(Analyzer)
//!   ├── renderer ──► watchdog.report_active(Renderer)
//!   ├── logger   ──► watchdog.report_active(Logger)
//!   └── watchdog ──► watchdog.run(&token)
//! ```

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelCause, CancellationToken};
use crate::stage::{ExitStatus, StageStats, WorkerExit};
use crate::sync::{DeadlineSignal, Guard, TimedLock, WaitOutcome};

// =============================================================================
// WorkerId
// =============================================================================

/// Pipeline worker identity. The declaration order is the table index and
/// breaks ties between equally stale workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerId {
    Sampler,
    Analyzer,
    Renderer,
    Logger,
    Watchdog,
}

impl WorkerId {
    pub const COUNT: usize = 5;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Sampler,
        Self::Analyzer,
        Self::Renderer,
        Self::Logger,
        Self::Watchdog,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sampler => "sampler",
            Self::Analyzer => "analyzer",
            Self::Renderer => "renderer",
            Self::Logger => "logger",
            Self::Watchdog => "watchdog",
        }
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Config
// =============================================================================

/// Watchdog tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// A worker silent for longer than this trips the watchdog.
    pub allowed_unresponsive: Duration,
    /// Bound on every heartbeat-table lock acquire.
    pub lock_timeout: Duration,
    /// Upper bound on one supervisor sleep, so cancellation is seen promptly.
    pub wait_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            allowed_unresponsive: Duration::from_millis(2000),
            lock_timeout: Duration::from_millis(50),
            wait_timeout: Duration::from_millis(2000),
        }
    }
}

// =============================================================================
// Heartbeat table
// =============================================================================

#[derive(Debug)]
struct HeartbeatTable {
    last_seen: [Instant; WorkerId::COUNT],
}

impl HeartbeatTable {
    fn stamp(&mut self, worker: WorkerId, at: Instant) {
        self.last_seen[worker.index()] = at;
    }

    /// Oldest entry among `monitored`; lowest index wins ties.
    fn stalest(&self, monitored: &[WorkerId]) -> Option<(WorkerId, Instant)> {
        let mut oldest: Option<(WorkerId, Instant)> = None;
        for &worker in monitored {
            let seen = self.last_seen[worker.index()];
            match oldest {
                Some((_, at)) if seen >= at => {}
                _ => oldest = Some((worker, seen)),
            }
        }
        oldest
    }
}

// =============================================================================
// Health report (serializable)
// =============================================================================

/// Health of one worker relative to the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Stale,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Per-worker heartbeat details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker: WorkerId,
    /// Time since the last heartbeat (ms).
    pub age_ms: u64,
    pub status: HealthStatus,
}

/// Heartbeat table snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp_ms: u64,
    pub budget_ms: u64,
    /// Stalest monitored worker.
    pub stalest: Option<WorkerId>,
    pub workers: Vec<WorkerHealth>,
}

impl HealthReport {
    /// Workers whose heartbeat is older than the budget.
    #[must_use]
    pub fn stale_workers(&self) -> Vec<&WorkerHealth> {
        self.workers
            .iter()
            .filter(|w| w.status == HealthStatus::Stale)
            .collect()
    }
}

// =============================================================================
// Watchdog
// =============================================================================

/// Heartbeat table plus supervisor.
#[derive(Debug)]
pub struct Watchdog {
    config: WatchdogConfig,
    monitored: Vec<WorkerId>,
    table: TimedLock<HeartbeatTable>,
    updated: DeadlineSignal,
}

impl Watchdog {
    /// Watchdog monitoring every worker. All entries start at "now".
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        Self::monitoring(config, &WorkerId::ALL)
    }

    /// Watchdog monitoring only `workers`. Heartbeats from other workers are
    /// still recorded but never trip it.
    #[must_use]
    pub fn monitoring(config: WatchdogConfig, workers: &[WorkerId]) -> Self {
        let now = Instant::now();
        let mut monitored = workers.to_vec();
        monitored.sort_unstable();
        monitored.dedup();
        Self {
            config,
            monitored,
            table: TimedLock::new(HeartbeatTable {
                last_seen: [now; WorkerId::COUNT],
            }),
            updated: DeadlineSignal::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    #[must_use]
    pub fn budget(&self) -> Duration {
        self.config.allowed_unresponsive
    }

    /// Stamp `worker`'s heartbeat with "now" and wake the supervisor.
    ///
    /// A lock timeout is logged and not retried; returns whether the stamp
    /// was recorded.
    pub fn report_active(&self, worker: WorkerId) -> bool {
        self.report_active_at(worker, Instant::now())
    }

    fn report_active_at(&self, worker: WorkerId, at: Instant) -> bool {
        match self.table.try_acquire(self.config.lock_timeout) {
            Ok(mut table) => {
                table.stamp(worker, at);
                drop(table);
                self.updated.signal_one();
                true
            }
            Err(err) => {
                warn!(worker = %worker, error = %err, "Heartbeat not recorded");
                false
            }
        }
    }

    /// Stalest monitored worker and the time since its last heartbeat.
    #[must_use]
    pub fn stalest(&self) -> Option<(WorkerId, Duration)> {
        let table = self.table.try_acquire(self.config.lock_timeout).ok()?;
        table
            .stalest(&self.monitored)
            .map(|(worker, seen)| (worker, seen.elapsed()))
    }

    /// Serializable snapshot, `None` when the table lock timed out.
    #[must_use]
    pub fn snapshot(&self) -> Option<HealthReport> {
        let table = self.table.try_acquire(self.config.lock_timeout).ok()?;
        Some(self.report(&table, Instant::now()))
    }

    fn report(&self, table: &HeartbeatTable, now: Instant) -> HealthReport {
        let budget = self.budget();
        let workers = self
            .monitored
            .iter()
            .map(|&worker| {
                let age = now.saturating_duration_since(table.last_seen[worker.index()]);
                WorkerHealth {
                    worker,
                    age_ms: age.as_millis() as u64,
                    status: if age > budget {
                        HealthStatus::Stale
                    } else {
                        HealthStatus::Healthy
                    },
                }
            })
            .collect();
        HealthReport {
            timestamp_ms: epoch_ms(),
            budget_ms: budget.as_millis() as u64,
            stalest: table.stalest(&self.monitored).map(|(worker, _)| worker),
            workers,
        }
    }

    /// Supervisor loop. Returns when the token is raised by someone else
    /// ([`ExitStatus::Cancelled`]) or after raising it itself
    /// ([`ExitStatus::Tripped`]).
    pub fn run(&self, token: &CancellationToken) -> WorkerExit {
        let me = WorkerId::Watchdog;
        let budget = self.budget();
        let mut stats = StageStats::default();
        info!(
            worker = %me,
            budget_ms = budget.as_millis() as u64,
            monitored = self.monitored.len(),
            "Watchdog started"
        );

        loop {
            stats.iterations += 1;
            if token.is_cancelled() {
                break;
            }

            let mut table = match self.table.try_acquire(self.config.lock_timeout) {
                Ok(table) => table,
                Err(err) => {
                    stats.lock_timeouts += 1;
                    warn!(worker = %me, error = %err, "Heartbeat table lock timed out");
                    continue;
                }
            };

            let now = Instant::now();
            table.stamp(me, now);
            let cap = now + self.config.wait_timeout;
            let deadline = table
                .stalest(&self.monitored)
                .map_or(cap, |(_, oldest)| (oldest + budget).min(cap));
            if self.updated.wait_until(&mut table, deadline) == WaitOutcome::TimedOut {
                stats.wait_timeouts += 1;
            }
            if token.is_cancelled() {
                break;
            }

            let now = Instant::now();
            table.stamp(me, now);
            if let Some(stalled) = self.check(&table, now) {
                return self.trip(table, stalled, now, token, stats);
            }
        }

        info!(worker = %me, iterations = stats.iterations, "Watchdog exiting");
        WorkerExit {
            worker: me,
            status: ExitStatus::Cancelled,
            stats,
        }
    }

    /// Worker silent for longer than the budget at `now`, if any.
    fn check(&self, table: &HeartbeatTable, now: Instant) -> Option<WorkerId> {
        let (worker, oldest) = table.stalest(&self.monitored)?;
        (now.saturating_duration_since(oldest) > self.budget()).then_some(worker)
    }

    fn trip(
        &self,
        table: Guard<'_, HeartbeatTable>,
        stalled: WorkerId,
        now: Instant,
        token: &CancellationToken,
        stats: StageStats,
    ) -> WorkerExit {
        token.cancel(CancelCause::Unresponsive(stalled));
        let report = self.report(&table, now);
        let silent_ms = now
            .saturating_duration_since(table.last_seen[stalled.index()])
            .as_millis() as u64;
        drop(table);

        error!(
            worker = %WorkerId::Watchdog,
            stalled = %stalled,
            silent_ms,
            budget_ms = report.budget_ms,
            "Watchdog: worker unresponsive, cancelling pipeline"
        );
        if let Ok(json) = serde_json::to_string_pretty(&report) {
            error!(worker = %WorkerId::Watchdog, diagnostic = %json, "Watchdog: diagnostic dump");
        }
        debug!(worker = %WorkerId::Watchdog, "Watchdog exiting after trip");

        WorkerExit {
            worker: WorkerId::Watchdog,
            status: ExitStatus::Tripped { stalled },
            stats,
        }
    }
}

/// Current time as epoch milliseconds.
fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fast_config(budget_ms: u64) -> WatchdogConfig {
        WatchdogConfig {
            allowed_unresponsive: Duration::from_millis(budget_ms),
            lock_timeout: Duration::from_millis(50),
            wait_timeout: Duration::from_millis(budget_ms),
        }
    }

    #[test]
    fn worker_ids_are_ordered_by_index() {
        for (i, worker) in WorkerId::ALL.iter().enumerate() {
            assert_eq!(worker.index(), i);
        }
        assert_eq!(WorkerId::Sampler.to_string(), "sampler");
        assert_eq!(WorkerId::Watchdog.to_string(), "watchdog");
    }

    #[test]
    fn worker_id_serde_snake_case() {
        let json = serde_json::to_string(&WorkerId::Renderer).unwrap();
        assert_eq!(json, "\"renderer\"");
        let back: WorkerId = serde_json::from_str("\"logger\"").unwrap();
        assert_eq!(back, WorkerId::Logger);
    }

    #[test]
    fn all_entries_start_fresh() {
        let dog = Watchdog::new(WatchdogConfig::default());
        let report = dog.snapshot().unwrap();
        assert_eq!(report.workers.len(), WorkerId::COUNT);
        assert!(report.stale_workers().is_empty());
        assert_eq!(report.budget_ms, 2000);
    }

    #[test]
    fn stalest_breaks_ties_by_lowest_index() {
        let dog = Watchdog::new(WatchdogConfig::default());
        let (worker, _) = dog.stalest().unwrap();
        assert_eq!(worker, WorkerId::Sampler, "all stamped at creation");

        dog.report_active(WorkerId::Sampler);
        let (worker, _) = dog.stalest().unwrap();
        assert_eq!(worker, WorkerId::Analyzer);
    }

    #[test]
    fn stalest_picks_oldest_entry() {
        let dog = Watchdog::new(WatchdogConfig::default());
        let base = Instant::now();
        for (i, worker) in WorkerId::ALL.iter().enumerate() {
            dog.report_active_at(*worker, base + Duration::from_millis(10 * (5 - i as u64)));
        }
        assert_eq!(dog.stalest().unwrap().0, WorkerId::Watchdog);
    }

    #[test]
    fn unmonitored_workers_are_ignored() {
        let dog = Watchdog::monitoring(
            WatchdogConfig::default(),
            &[WorkerId::Renderer, WorkerId::Analyzer, WorkerId::Analyzer],
        );
        let report = dog.snapshot().unwrap();
        let ids: Vec<_> = report.workers.iter().map(|w| w.worker).collect();
        assert_eq!(ids, vec![WorkerId::Analyzer, WorkerId::Renderer]);
        assert_eq!(report.stalest, Some(WorkerId::Analyzer));
    }

    #[test]
    fn snapshot_marks_stale_workers() {
        let dog = Watchdog::new(fast_config(30));
        thread::sleep(Duration::from_millis(60));
        dog.report_active(WorkerId::Analyzer);
        let report = dog.snapshot().unwrap();
        let stale: Vec<_> = report.stale_workers().iter().map(|w| w.worker).collect();
        assert!(!stale.contains(&WorkerId::Analyzer));
        assert!(stale.contains(&WorkerId::Sampler));
    }

    #[test]
    fn report_is_serializable() {
        let dog = Watchdog::new(WatchdogConfig::default());
        let json = serde_json::to_string(&dog.snapshot().unwrap()).unwrap();
        assert!(json.contains("\"budget_ms\":2000"));
        assert!(json.contains("\"worker\":\"sampler\""));
        assert!(json.contains("\"status\":\"healthy\""));
    }

    #[test]
    fn exits_cancelled_when_token_already_set() {
        let dog = Watchdog::new(fast_config(1000));
        let token = CancellationToken::new();
        token.cancel(CancelCause::Requested);
        let exit = dog.run(&token);
        assert_eq!(exit.status, ExitStatus::Cancelled);
        assert_eq!(exit.status.code(), 0);
    }

    #[test]
    fn trips_on_silent_worker_and_names_it() {
        let start = Instant::now();
        let dog = Arc::new(Watchdog::monitoring(
            fast_config(100),
            &[WorkerId::Sampler, WorkerId::Analyzer, WorkerId::Renderer],
        ));
        let token = CancellationToken::new();

        // Sampler and Analyzer keep beating; Renderer stays silent.
        let beaters: Vec<_> = [WorkerId::Sampler, WorkerId::Analyzer]
            .into_iter()
            .map(|worker| {
                let dog = Arc::clone(&dog);
                let token = token.clone();
                thread::spawn(move || {
                    while !token.is_cancelled() {
                        dog.report_active(worker);
                        thread::sleep(Duration::from_millis(10));
                    }
                })
            })
            .collect();

        let exit = dog.run(&token);
        let elapsed = start.elapsed();

        assert_eq!(
            exit.status,
            ExitStatus::Tripped {
                stalled: WorkerId::Renderer
            }
        );
        assert_eq!(exit.status.code(), 3);
        assert_eq!(token.cause(), Some(CancelCause::Unresponsive(WorkerId::Renderer)));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));

        for handle in beaters {
            handle.join().unwrap();
        }
    }

    #[test]
    fn healthy_workers_do_not_trip_before_cancel() {
        let dog = Arc::new(Watchdog::monitoring(fast_config(200), &[WorkerId::Sampler]));
        let token = CancellationToken::new();

        let beater = {
            let dog = Arc::clone(&dog);
            let token = token.clone();
            thread::spawn(move || {
                let stop = Instant::now() + Duration::from_millis(400);
                while Instant::now() < stop {
                    dog.report_active(WorkerId::Sampler);
                    thread::sleep(Duration::from_millis(20));
                }
                token.cancel(CancelCause::Requested);
            })
        };

        let exit = dog.run(&token);
        assert_eq!(exit.status, ExitStatus::Cancelled);
        assert_eq!(token.cause(), Some(CancelCause::Requested));
        beater.join().unwrap();
    }

    #[test]
    fn three_worker_budget_scenario() {
        // Budget 2000 ms; Sampler and Analyzer beat every 100 ms while
        // Renderer stops. Detection happens within budget + wait timeout and
        // names Renderer.
        let config = WatchdogConfig {
            allowed_unresponsive: Duration::from_millis(2000),
            lock_timeout: Duration::from_millis(50),
            wait_timeout: Duration::from_millis(500),
        };
        let start = Instant::now();
        let dog = Arc::new(Watchdog::monitoring(
            config,
            &[WorkerId::Sampler, WorkerId::Analyzer, WorkerId::Renderer],
        ));
        let token = CancellationToken::new();

        let beaters: Vec<_> = [WorkerId::Sampler, WorkerId::Analyzer]
            .into_iter()
            .map(|worker| {
                let dog = Arc::clone(&dog);
                let token = token.clone();
                thread::spawn(move || {
                    while !token.is_cancelled() {
                        dog.report_active(worker);
                        thread::sleep(Duration::from_millis(100));
                    }
                })
            })
            .collect();

        let exit = dog.run(&token);
        let elapsed = start.elapsed();

        assert_eq!(
            exit.status,
            ExitStatus::Tripped {
                stalled: WorkerId::Renderer
            }
        );
        assert!(elapsed >= Duration::from_millis(2000));
        assert!(elapsed <= Duration::from_millis(2500) + Duration::from_millis(500));

        for handle in beaters {
            handle.join().unwrap();
        }
    }
}
