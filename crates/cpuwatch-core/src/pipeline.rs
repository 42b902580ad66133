//! Pipeline assembly: channels, shared handles, worker threads, exit report.

use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::analyzer::run_analyzer;
use crate::cancel::{CancelCause, CancellationToken};
use crate::config::PipelineConfig;
use crate::handoff::{self, Consumer, Producer};
use crate::logging::LogDrain;
use crate::procstat::{ProcStat, SampleSource, detect_cpu_count};
use crate::render::{UsageRenderer, run_renderer};
use crate::sampler::run_sampler;
use crate::stage::{ExitStatus, SETUP_LOG_FILE_UNAVAILABLE, StageContext, WorkerExit};
use crate::usage::CpuUsage;
use crate::watchdog::{Watchdog, WorkerId};
use crate::{Error, Result};

/// How a pipeline run ended, from the operator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "worker")]
pub enum Outcome {
    /// Every worker observed cancellation.
    Clean,
    /// The watchdog cancelled the pipeline because this worker went silent.
    Tripped(WorkerId),
    /// This worker never entered its loop.
    SetupFailed(WorkerId),
}

impl Outcome {
    /// Process exit code: 0 clean, 1 watchdog trip, 2 setup failure.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Tripped(_) => 1,
            Self::SetupFailed(_) => 2,
        }
    }
}

/// Everything known after all workers were joined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub cause: Option<CancelCause>,
    pub elapsed_ms: u64,
    /// In worker index order.
    pub exits: Vec<WorkerExit>,
}

impl PipelineReport {
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if let Some(failed) = self
            .exits
            .iter()
            .find(|e| matches!(e.status, ExitStatus::SetupFailed { .. }))
        {
            return Outcome::SetupFailed(failed.worker);
        }
        self.exits
            .iter()
            .find_map(|e| match e.status {
                ExitStatus::Tripped { stalled } => Some(Outcome::Tripped(stalled)),
                _ => None,
            })
            .unwrap_or(Outcome::Clean)
    }

    #[must_use]
    pub fn exit(&self, worker: WorkerId) -> Option<&WorkerExit> {
        self.exits.iter().find(|e| e.worker == worker)
    }

    /// Per-worker exit table.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let cause = self
            .cause
            .map_or_else(|| "not cancelled".to_string(), |c| c.to_string());
        let _ = writeln!(
            out,
            "cpuwatch stopped ({cause}) after {:.1} s",
            self.elapsed_ms as f64 / 1000.0
        );
        let _ = writeln!(
            out,
            "{:<10} {:>5} {:>10} {:>9} {:>9} {:>8} {:>7}  status",
            "worker", "code", "iterations", "consumed", "produced", "dropped", "errors"
        );
        for exit in &self.exits {
            let s = &exit.stats;
            let _ = writeln!(
                out,
                "{:<10} {:>5} {:>10} {:>9} {:>9} {:>8} {:>7}  {}",
                exit.worker.as_str(),
                exit.status.code(),
                s.iterations,
                s.consumed,
                s.produced,
                s.dropped,
                s.errors,
                exit.status
            );
        }
        out
    }
}

/// A configured, not yet started pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    token: CancellationToken,
    watchdog: Arc<Watchdog>,
    raw: (Producer<ProcStat>, Consumer<ProcStat>),
    usage: (Producer<CpuUsage>, Consumer<CpuUsage>),
}

impl Pipeline {
    /// Validate `config` and create the token, watchdog and channels.
    ///
    /// The Logger is monitored only when a log file is configured.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let monitored: Vec<WorkerId> = WorkerId::ALL
            .into_iter()
            .filter(|w| *w != WorkerId::Logger || config.log.file.is_some())
            .collect();
        let watchdog = Arc::new(Watchdog::monitoring(config.watchdog_config(), &monitored));
        let raw = handoff::channel(config.queues.raw_capacity)?;
        let usage = handoff::channel(config.queues.usage_capacity)?;
        Ok(Self {
            config,
            token: CancellationToken::new(),
            watchdog,
            raw,
            usage,
        })
    }

    /// The pipeline-wide token. Cancel it (or route signals to it) to stop.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn every worker, block until all have exited, and report.
    ///
    /// The Logger stops last, after every other worker has been joined, so
    /// their final lines reach the file.
    pub fn run<S, R>(self, source: S, renderer: R, log: Option<LogDrain>) -> Result<PipelineReport>
    where
        S: SampleSource + 'static,
        R: UsageRenderer + 'static,
    {
        let Self {
            config,
            token,
            watchdog,
            raw: (raw_tx, raw_rx),
            usage: (usage_tx, usage_rx),
        } = self;
        let started = Instant::now();
        let timing = config.stage_timing();
        let interval = config.sample_interval();
        let context =
            |worker| StageContext::new(worker, token.clone(), Arc::clone(&watchdog), timing);

        info!(
            cpus = detect_cpu_count(&config.source.procstat_path),
            sample_interval_ms = config.timing.sample_interval_ms,
            budget_ms = config.watchdog.allowed_unresponsive_ms,
            "Pipeline starting"
        );

        let mut handles: Vec<(WorkerId, JoinHandle<WorkerExit>)> = Vec::new();
        let mut spawn_failure = None;

        let log_token = CancellationToken::new();
        let logger = match log {
            Some(drain) => {
                let (token, watchdog) = (log_token.clone(), Arc::clone(&watchdog));
                match spawn(WorkerId::Logger, move || drain.run(token, watchdog, timing)) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        spawn_failure = Some(err);
                        None
                    }
                }
            }
            None => None,
        };

        if spawn_failure.is_none() {
            let mut source = source;
            let ctx = context(WorkerId::Sampler);
            let sampler = spawn(WorkerId::Sampler, move || {
                run_sampler(ctx, &mut source, &raw_tx, interval)
            });
            let ctx = context(WorkerId::Analyzer);
            let analyzer = spawn(WorkerId::Analyzer, move || {
                run_analyzer(ctx, &raw_rx, &usage_tx)
            });
            let mut renderer = renderer;
            let ctx = context(WorkerId::Renderer);
            let render = spawn(WorkerId::Renderer, move || {
                run_renderer(ctx, &usage_rx, &mut renderer)
            });
            let (dog_token, dog) = (token.clone(), Arc::clone(&watchdog));
            let supervisor = spawn(WorkerId::Watchdog, move || dog.run(&dog_token));

            for (worker, spawned) in [
                (WorkerId::Sampler, sampler),
                (WorkerId::Analyzer, analyzer),
                (WorkerId::Renderer, render),
                (WorkerId::Watchdog, supervisor),
            ] {
                match spawned {
                    Ok(handle) => handles.push((worker, handle)),
                    Err(err) => {
                        spawn_failure.get_or_insert(err);
                    }
                }
            }
        }

        if spawn_failure.is_some() {
            token.cancel(CancelCause::Requested);
        }

        let mut exits = Vec::with_capacity(WorkerId::COUNT);
        let mut panicked = Vec::new();
        for (worker, handle) in handles {
            match handle.join() {
                Ok(exit) => exits.push(exit),
                Err(_) => {
                    token.cancel(CancelCause::Requested);
                    error!(worker = %worker, "Worker thread panicked");
                    panicked.push(worker);
                }
            }
        }

        log_token.cancel(CancelCause::Requested);
        if let Some(handle) = logger {
            match handle.join() {
                Ok(exit) => exits.push(exit),
                Err(_) => panicked.push(WorkerId::Logger),
            }
        } else if spawn_failure.is_none() && watchdog_monitors_logger(&config) {
            exits.push(WorkerExit::setup_failed(
                WorkerId::Logger,
                SETUP_LOG_FILE_UNAVAILABLE,
                "log file configured but no log sink was installed",
            ));
        }

        if let Some(err) = spawn_failure {
            return Err(err);
        }
        if !panicked.is_empty() {
            let names: Vec<_> = panicked.iter().map(|w| w.as_str()).collect();
            return Err(Error::Setup(format!("worker panicked: {}", names.join(", "))));
        }

        exits.sort_by_key(|e| e.worker);
        let report = PipelineReport {
            cause: token.cause(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            exits,
        };
        info!(outcome = ?report.outcome(), cause = ?report.cause, "Pipeline stopped");
        Ok(report)
    }
}

fn watchdog_monitors_logger(config: &PipelineConfig) -> bool {
    config.log.file.is_some()
}

fn spawn<F>(worker: WorkerId, body: F) -> Result<JoinHandle<WorkerExit>>
where
    F: FnOnce() -> WorkerExit + Send + 'static,
{
    thread::Builder::new()
        .name(format!("cpuwatch-{worker}"))
        .spawn(body)
        .map_err(|err| Error::Setup(format!("cannot spawn {worker} thread: {err}")))
}
