//! Structured logging for cpuwatch
//!
//! `tracing` events go to stderr and, when a log file is configured, to a
//! queue-backed sink drained by the Logger worker.
//!
//! # Features
//!
//! - **Pretty format**: Human-friendly colored output for interactive use
//! - **JSON format**: Machine-parseable JSON lines
//! - **File output**: Lines are enqueued into a drop-oldest bounded queue,
//!   so a slow disk never stalls the thread that logged
//! - **Correlation field**: every worker event carries `worker = <name>`
//!
//! # Usage
//!
//! ```ignore
//! use cpuwatch_core::logging::{init_logging, LogConfig};
//!
//! let drain = init_logging(&LogConfig::default(), 100)?;
//! ```
//!
//! `RUST_LOG` overrides the configured level, e.g.
//! `RUST_LOG=cpuwatch_core=debug`.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::bounded_queue::{QueueError, QueueStats};
use crate::cancel::CancellationToken;
use crate::handoff::{self, Consumer, Producer};
use crate::stage::{
    Consumed, SETUP_LOG_FILE_UNAVAILABLE, StageContext, StageTiming, WorkerExit,
};
use crate::watchdog::{Watchdog, WorkerId};

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Bound on a logging thread's wait for the sink lock.
pub const SINK_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG environment variable
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional append-only log file, written by the Logger worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to create log sink: {0}")]
    Sink(#[from] QueueError),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let existed = parent.exists();
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            if !existed {
                let permissions = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(parent, permissions)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path, mode: u32) -> io::Result<()> {
    let permissions = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, permissions)
}

/// Open `path` for appending, creating it (and its parent) if needed.
fn open_log_file(path: &Path) -> io::Result<File> {
    ensure_parent_dir(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        set_file_permissions(path, 0o600)?;
    }
    Ok(file)
}

// =============================================================================
// Queue-backed sink
// =============================================================================

/// Writing side of the log queue. Cheap to clone; every clone feeds the same
/// queue. Full queues drop their oldest line.
#[derive(Clone)]
pub struct LogSink {
    producer: Arc<Producer<String>>,
    lock_timeout: Duration,
    refused: Arc<AtomicU64>,
}

impl LogSink {
    /// Create a sink holding up to `capacity` lines, plus the drain that the
    /// Logger worker empties into `path`.
    pub fn new(
        capacity: usize,
        lock_timeout: Duration,
        path: impl Into<PathBuf>,
    ) -> Result<(Self, LogDrain), QueueError> {
        let (producer, consumer) = handoff::channel(capacity)?;
        let sink = Self {
            producer: Arc::new(producer),
            lock_timeout,
            refused: Arc::new(AtomicU64::new(0)),
        };
        let drain = LogDrain {
            consumer,
            sink: sink.clone(),
            path: path.into(),
        };
        Ok((sink, drain))
    }

    /// Enqueue one line. Returns `false` when the lock timed out and the
    /// line was discarded.
    pub fn push(&self, line: String) -> bool {
        let Ok(mut queue) = self.producer.lock(self.lock_timeout) else {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        queue.write(line);
        drop(queue);
        self.producer.notify_written();
        true
    }

    /// Lines discarded because the sink lock timed out.
    #[must_use]
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> Option<QueueStats> {
        self.producer.stats(self.lock_timeout)
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("lock_timeout", &self.lock_timeout)
            .field("refused", &self.refused())
            .finish_non_exhaustive()
    }
}

/// Buffers one formatted event and enqueues it as a single line on drop.
pub struct SinkWriter<'a> {
    sink: &'a LogSink,
    buf: Vec<u8>,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SinkWriter<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.sink.push(line);
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: self,
            buf: Vec::new(),
        }
    }
}

/// Reading side of the log queue, owned by the Logger worker.
pub struct LogDrain {
    consumer: Consumer<String>,
    sink: LogSink,
    path: PathBuf,
}

impl LogDrain {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logger worker loop.
    ///
    /// Opens the file first; if that fails the worker exits with
    /// [`SETUP_LOG_FILE_UNAVAILABLE`] without entering its loop. Each
    /// iteration moves every queued line into a local batch under the lock
    /// and writes the batch after releasing it. On cancellation whatever is
    /// still queued is written before returning.
    pub fn run(
        self,
        token: CancellationToken,
        watchdog: Arc<Watchdog>,
        timing: StageTiming,
    ) -> WorkerExit {
        let file = match open_log_file(&self.path) {
            Ok(file) => file,
            Err(err) => {
                return WorkerExit::setup_failed(
                    WorkerId::Logger,
                    SETUP_LOG_FILE_UNAVAILABLE,
                    format!("{}: {err}", self.path.display()),
                );
            }
        };
        let mut out = BufWriter::new(file);
        let mut ctx = StageContext::new(WorkerId::Logger, token, watchdog, timing);
        let mut batch = Vec::new();

        while ctx.begin_iteration() {
            match ctx.consume_batch(&self.consumer, &mut batch, usize::MAX) {
                Consumed::Item(_) => write_batch(&mut out, &mut batch, &mut ctx),
                Consumed::NoData => {}
                Consumed::Cancelled => break,
            }
        }

        match self.consumer.lock(timing.lock_timeout) {
            Ok(mut queue) => {
                queue.read_many(&mut batch, usize::MAX);
            }
            Err(err) => {
                ctx.stats_mut().lock_timeouts += 1;
                tracing::warn!(worker = %WorkerId::Logger, error = %err, "Final drain skipped");
            }
        }
        write_batch(&mut out, &mut batch, &mut ctx);

        let overwritten = self
            .consumer
            .stats(timing.lock_timeout)
            .map_or(0, |s| s.total_dropped);
        let refused = self.sink.refused();
        ctx.stats_mut().dropped = overwritten + refused;
        if overwritten + refused > 0 {
            tracing::warn!(
                worker = %WorkerId::Logger,
                overwritten,
                refused,
                "Log lines were dropped under pressure"
            );
        }
        ctx.finish()
    }
}

fn write_batch(out: &mut BufWriter<File>, batch: &mut Vec<String>, ctx: &mut StageContext) {
    if batch.is_empty() {
        return;
    }
    let result = batch
        .iter()
        .try_for_each(|line| out.write_all(line.as_bytes()))
        .and_then(|()| out.flush());
    batch.clear();
    if let Err(err) = result {
        ctx.stats_mut().errors += 1;
        tracing::error!(worker = %WorkerId::Logger, error = %err, "Log file write failed");
    }
}

// =============================================================================
// Subscriber installation
// =============================================================================

/// Initialize the global logging subscriber
///
/// This function should be called once at application startup.
/// Subsequent calls will return `Err(LogError::AlreadyInitialized)`.
///
/// When `config.file` is set, a sink of `sink_capacity` lines is installed
/// behind the stderr layer and its [`LogDrain`] is returned for the Logger
/// worker. The file itself is opened by that worker.
pub fn init_logging(
    config: &LogConfig,
    sink_capacity: usize,
) -> Result<Option<LogDrain>, LogError> {
    // Check if already initialized
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }
    config
        .level
        .parse::<LogLevel>()
        .map_err(|_| LogError::InvalidLevel(config.level.clone()))?;

    // Build environment filter with fallback to config level
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (sink, drain) = match &config.file {
        Some(path) => {
            let (sink, drain) = LogSink::new(sink_capacity, SINK_LOCK_TIMEOUT, path)?;
            (Some(sink), Some(drain))
        }
        None => (None, None),
    };

    // Configure and install subscriber based on format
    match config.format {
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::NONE)
                    .with_ansi(true),
            );

            if let Some(sink) = sink {
                let file_layer = fmt::layer()
                    .with_writer(sink)
                    .with_target(true)
                    .with_ansi(false);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            );

            if let Some(sink) = sink {
                let file_layer = fmt::layer()
                    .json()
                    .with_writer(sink)
                    .with_timer(SystemTime)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
    }

    // Mark as initialized
    let _ = LOGGING_INITIALIZED.set(true);

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(drain)
}

/// Log levels that can be used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}
