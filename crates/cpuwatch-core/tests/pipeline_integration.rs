//! End-to-end pipeline tests with scripted sources and renderers.
//!
//! Covers cancellation propagation, liveness detection naming the stalled
//! worker, Logger setup failure escalation, and the log file drain.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

use cpuwatch_core::cancel::CancelCause;
use cpuwatch_core::config::PipelineConfig;
use cpuwatch_core::logging::{LogSink, SINK_LOCK_TIMEOUT};
use cpuwatch_core::pipeline::{Outcome, Pipeline, PipelineReport};
use cpuwatch_core::procstat::{CpuTimes, ProcStat, ProcStatError, SampleSource};
use cpuwatch_core::render::UsageRenderer;
use cpuwatch_core::stage::{ExitStatus, SETUP_LOG_FILE_UNAVAILABLE};
use cpuwatch_core::usage::CpuUsage;
use cpuwatch_core::watchdog::WorkerId;

// =============================================================================
// Fakes
// =============================================================================

/// Every sample advances each cpu by 10 busy and 30 idle jiffies (25 %).
struct Ticking {
    tick: u64,
    cpus: usize,
}

impl Ticking {
    fn new(cpus: usize) -> Self {
        Self { tick: 0, cpus }
    }
}

impl SampleSource for Ticking {
    fn sample(&mut self) -> Result<ProcStat, ProcStatError> {
        self.tick += 1;
        let per_cpu = CpuTimes {
            user: 10 * self.tick,
            idle: 30 * self.tick,
            ..CpuTimes::default()
        };
        let n = self.cpus as u64;
        Ok(ProcStat {
            total: CpuTimes {
                user: per_cpu.user * n,
                idle: per_cpu.idle * n,
                ..CpuTimes::default()
            },
            cpus: vec![per_cpu; self.cpus],
        })
    }
}

#[derive(Clone, Default)]
struct Collect {
    seen: Arc<Mutex<Vec<CpuUsage>>>,
    stall_once: Option<Duration>,
    stalled: Arc<AtomicBool>,
}

impl Collect {
    fn stalling(duration: Duration) -> Self {
        Self {
            stall_once: Some(duration),
            ..Self::default()
        }
    }

    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

impl UsageRenderer for Collect {
    fn render(&mut self, usage: &CpuUsage) -> io::Result<()> {
        self.seen.lock().push(usage.clone());
        if let Some(stall) = self.stall_once {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                thread::sleep(stall);
            }
        }
        Ok(())
    }
}

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.timing.sample_interval_ms = 20;
    config.timing.wait_timeout_ms = 200;
    config.watchdog.allowed_unresponsive_ms = 600;
    config
}

fn wait_for(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn assert_all_cancelled(report: &PipelineReport, workers: &[WorkerId]) {
    for &worker in workers {
        let exit = report.exit(worker).unwrap();
        assert_eq!(exit.status, ExitStatus::Cancelled, "{worker}");
    }
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn requested_cancel_stops_every_worker_cleanly() {
    let pipeline = Pipeline::new(fast_config()).unwrap();
    let token = pipeline.token().clone();
    let renderer = Collect::default();
    let rendered = renderer.clone();

    let handle = thread::spawn(move || pipeline.run(Ticking::new(2), renderer, None));
    assert!(wait_for(|| rendered.len() >= 3, Duration::from_secs(10)));

    let cancelled_at = Instant::now();
    token.cancel(CancelCause::Requested);
    let report = handle.join().unwrap().unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));

    assert_eq!(report.outcome(), Outcome::Clean);
    assert_eq!(report.cause, Some(CancelCause::Requested));
    assert_eq!(report.exits.len(), 4);
    assert!(report.exit(WorkerId::Logger).is_none());
    assert_all_cancelled(
        &report,
        &[
            WorkerId::Sampler,
            WorkerId::Analyzer,
            WorkerId::Renderer,
            WorkerId::Watchdog,
        ],
    );

    let seen = rendered.seen.lock();
    for usage in seen.iter() {
        assert_eq!(usage.total, Some(25.0));
        assert_eq!(usage.cpus, vec![Some(25.0), Some(25.0)]);
    }
    let renderer_exit = report.exit(WorkerId::Renderer).unwrap();
    assert_eq!(renderer_exit.stats.consumed as usize, seen.len());
}

#[test]
fn nothing_is_rendered_after_cancellation() {
    let pipeline = Pipeline::new(fast_config()).unwrap();
    let token = pipeline.token().clone();
    let renderer = Collect::default();
    let rendered = renderer.clone();

    let handle = thread::spawn(move || pipeline.run(Ticking::new(1), renderer, None));
    assert!(wait_for(|| rendered.len() >= 2, Duration::from_secs(10)));
    token.cancel(CancelCause::Signal);
    let report = handle.join().unwrap().unwrap();

    let at_exit = rendered.len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(rendered.len(), at_exit);
    assert_eq!(report.cause, Some(CancelCause::Signal));
    assert_eq!(report.outcome().exit_code(), 0);
}

// =============================================================================
// Liveness detection
// =============================================================================

#[test]
fn longest_accepted_interval_stays_healthy() {
    let mut config = fast_config();
    config.timing.sample_interval_ms = config.watchdog.allowed_unresponsive_ms - 1;
    config.validate().unwrap();
    let pipeline = Pipeline::new(config).unwrap();
    let token = pipeline.token().clone();
    let renderer = Collect::default();
    let rendered = renderer.clone();

    let handle = thread::spawn(move || pipeline.run(Ticking::new(1), renderer, None));
    // Several full intervals, each nearly as long as the budget.
    thread::sleep(Duration::from_millis(2500));
    assert!(!token.is_cancelled());
    token.cancel(CancelCause::Requested);
    let report = handle.join().unwrap().unwrap();

    assert_eq!(report.outcome(), Outcome::Clean);
    assert_eq!(report.cause, Some(CancelCause::Requested));
    assert_all_cancelled(
        &report,
        &[
            WorkerId::Sampler,
            WorkerId::Analyzer,
            WorkerId::Renderer,
            WorkerId::Watchdog,
        ],
    );
    assert!(rendered.len() >= 2);
}

#[test]
fn stalled_renderer_trips_the_watchdog() {
    let config = fast_config();
    let budget = Duration::from_millis(config.watchdog.allowed_unresponsive_ms);
    let pipeline = Pipeline::new(config).unwrap();
    let renderer = Collect::stalling(Duration::from_secs(3));

    let started = Instant::now();
    let report = pipeline.run(Ticking::new(1), renderer, None).unwrap();

    assert_eq!(report.outcome(), Outcome::Tripped(WorkerId::Renderer));
    assert_eq!(report.outcome().exit_code(), 1);
    assert_eq!(
        report.cause,
        Some(CancelCause::Unresponsive(WorkerId::Renderer))
    );
    let dog = report.exit(WorkerId::Watchdog).unwrap();
    assert_eq!(
        dog.status,
        ExitStatus::Tripped {
            stalled: WorkerId::Renderer
        }
    );
    assert_eq!(dog.status.code(), WorkerId::Renderer.index() as i32 + 1);
    assert_all_cancelled(&report, &[WorkerId::Sampler, WorkerId::Analyzer]);
    assert!(started.elapsed() >= budget);
}

// =============================================================================
// Logger
// =============================================================================

#[test]
fn logger_drains_sink_into_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("cpuwatch.log");
    let mut config = fast_config();
    config.log.file = Some(path.clone());

    let (sink, drain) = LogSink::new(16, SINK_LOCK_TIMEOUT, &path).unwrap();
    let pipeline = Pipeline::new(config).unwrap();
    let token = pipeline.token().clone();
    let renderer = Collect::default();
    let rendered = renderer.clone();

    let handle = thread::spawn(move || pipeline.run(Ticking::new(1), renderer, Some(drain)));
    assert!(sink.push("first line\n".to_string()));
    assert!(wait_for(|| rendered.len() >= 2, Duration::from_secs(10)));
    assert!(sink.push("second line\n".to_string()));
    token.cancel(CancelCause::Requested);

    let report = handle.join().unwrap().unwrap();
    assert_eq!(report.outcome(), Outcome::Clean);
    assert_eq!(report.exits.len(), 5);
    assert_all_cancelled(&report, &WorkerId::ALL);

    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written, "first line\nsecond line\n");
    assert_eq!(report.exit(WorkerId::Logger).unwrap().stats.dropped, 0);
}

#[test]
fn unopenable_log_file_fails_setup_and_escalates() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the log directory should be.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "x").unwrap();
    let path: PathBuf = blocker.join("cpuwatch.log");

    let mut config = fast_config();
    config.log.file = Some(path.clone());
    let (_sink, drain) = LogSink::new(4, SINK_LOCK_TIMEOUT, &path).unwrap();
    let pipeline = Pipeline::new(config).unwrap();

    let report = pipeline
        .run(Ticking::new(1), Collect::default(), Some(drain))
        .unwrap();

    assert_eq!(report.outcome(), Outcome::SetupFailed(WorkerId::Logger));
    assert_eq!(report.outcome().exit_code(), 2);
    let logger = report.exit(WorkerId::Logger).unwrap();
    assert_eq!(logger.status.code(), SETUP_LOG_FILE_UNAVAILABLE);
    assert_eq!(
        report.cause,
        Some(CancelCause::Unresponsive(WorkerId::Logger))
    );
}

#[test]
fn missing_log_drain_is_reported_as_setup_failure() {
    let mut config = fast_config();
    config.log.file = Some(PathBuf::from("never-opened.log"));
    let pipeline = Pipeline::new(config).unwrap();

    let report = pipeline
        .run(Ticking::new(1), Collect::default(), None)
        .unwrap();

    assert_eq!(report.outcome(), Outcome::SetupFailed(WorkerId::Logger));
    assert_eq!(
        report.exit(WorkerId::Watchdog).unwrap().status,
        ExitStatus::Tripped {
            stalled: WorkerId::Logger
        }
    );
}

#[test]
fn startup_line_reports_detected_cpus() {
    let dir = tempfile::tempdir().unwrap();
    let stat = dir.path().join("stat");
    std::fs::write(
        &stat,
        "cpu  30 0 0 90 0 0 0 0 0 0\n\
         cpu0 10 0 0 30 0 0 0 0 0 0\n\
         cpu1 10 0 0 30 0 0 0 0 0 0\n\
         cpu2 10 0 0 30 0 0 0 0 0 0\n",
    )
    .unwrap();
    let path = dir.path().join("cpuwatch.log");
    let mut config = fast_config();
    config.source.procstat_path = stat;
    config.log.file = Some(path.clone());

    let (sink, drain) = LogSink::new(64, SINK_LOCK_TIMEOUT, &path).unwrap();
    let pipeline = Pipeline::new(config).unwrap();
    let token = pipeline.token().clone();
    let renderer = Collect::default();
    let rendered = renderer.clone();

    let canceller = thread::spawn(move || {
        assert!(wait_for(|| rendered.len() >= 2, Duration::from_secs(10)));
        token.cancel(CancelCause::Requested);
    });
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::new("info"))
        .with(fmt::layer().with_writer(sink).with_ansi(false));
    let report = tracing::subscriber::with_default(subscriber, || {
        pipeline.run(Ticking::new(1), renderer, Some(drain))
    })
    .unwrap();
    canceller.join().unwrap();

    assert_eq!(report.outcome(), Outcome::Clean);
    let written = std::fs::read_to_string(&path).unwrap();
    let start = written
        .lines()
        .find(|line| line.contains("Pipeline starting"))
        .unwrap();
    assert!(start.contains("cpus=3"), "{start}");
}
