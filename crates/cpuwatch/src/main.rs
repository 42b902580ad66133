//! cpuwatch CLI
//!
//! Thin wrapper over `cpuwatch-core`: resolves configuration, installs
//! logging and signal routing, runs the pipeline and turns its report into
//! an exit code.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cpuwatch_core::cancel::install_signal_handlers;
use cpuwatch_core::config::{LogFormat, OutputFormat, PipelineConfig};
use cpuwatch_core::logging::init_logging;
use cpuwatch_core::pipeline::Pipeline;
use cpuwatch_core::procstat::{ProcStatFile, SampleSource};
use cpuwatch_core::render::ConsoleRenderer;

/// Exit code for failures before or outside the pipeline.
const EXIT_SETUP_FAILED: u8 = 2;

/// Per-core CPU utilization with a self-supervising worker pipeline.
#[derive(Parser)]
#[command(name = "cpuwatch", version, about)]
struct Cli {
    /// Path to a TOML config file (defaults to <config dir>/cpuwatch/cpuwatch.toml when present).
    #[arg(short, long, global = true, env = "CPUWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Counter file to sample instead of /proc/stat.
    #[arg(long, global = true)]
    procstat: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline until interrupted (default).
    Run(RunArgs),
    /// Read one counter snapshot and print it as JSON.
    Sample,
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Sampling interval in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// How long a worker may go without a heartbeat, in milliseconds.
    #[arg(long)]
    budget_ms: Option<u64>,

    /// Console output format (text, json).
    #[arg(long)]
    format: Option<OutputFormat>,

    /// Do not clear the terminal between text frames.
    #[arg(long)]
    no_clear: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format (pretty, json).
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Append log lines to this file through the Logger worker.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl RunArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(ms) = self.interval_ms {
            config.timing.sample_interval_ms = ms;
        }
        if let Some(ms) = self.budget_ms {
            config.watchdog.allowed_unresponsive_ms = ms;
        }
        if let Some(format) = self.format {
            config.output.format = format;
        }
        if self.no_clear {
            config.output.clear_screen = false;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Some(file) = self.log_file {
            config.log.file = Some(file);
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<cpuwatch_core::Error>()
                .and_then(cpuwatch_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8> {
    let mut config = PipelineConfig::resolve(cli.config.as_deref())
        .map_err(cpuwatch_core::Error::from)
        .context("loading configuration")?;
    if let Some(path) = cli.procstat {
        config.source.procstat_path = path;
    }

    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => {
            args.apply(&mut config);
            run(config)
        }
        Command::Sample => sample(&config),
        Command::Config => {
            let text = config
                .to_toml_string()
                .map_err(cpuwatch_core::Error::from)?;
            print!("{text}");
            Ok(0)
        }
    }
}

fn run(config: PipelineConfig) -> Result<u8> {
    config
        .validate()
        .map_err(cpuwatch_core::Error::from)
        .context("validating configuration")?;

    let drain = init_logging(&config.log, config.queues.log_capacity)
        .map_err(cpuwatch_core::Error::from)
        .context("initializing logging")?;

    let source = ProcStatFile::new(&config.source.procstat_path);
    let renderer = ConsoleRenderer::stdout(config.output.format, config.output.clear_screen);
    let pipeline = Pipeline::new(config)?;
    install_signal_handlers(pipeline.token())
        .map_err(cpuwatch_core::Error::from)
        .context("installing signal handlers")?;

    let report = pipeline.run(source, renderer, drain)?;
    eprint!("{}", report.summary());

    let outcome = report.outcome();
    tracing::info!(?outcome, "cpuwatch exiting");
    Ok(u8::try_from(outcome.exit_code()).unwrap_or(EXIT_SETUP_FAILED))
}

fn sample(config: &PipelineConfig) -> Result<u8> {
    let mut source = ProcStatFile::new(&config.source.procstat_path);
    let stat = source
        .sample()
        .map_err(cpuwatch_core::Error::from)
        .with_context(|| format!("sampling {}", config.source.procstat_path.display()))?;
    let json = serde_json::to_string_pretty(&stat)?;
    println!("{json}");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_overrides_apply() {
        let cli = Cli::try_parse_from([
            "cpuwatch",
            "run",
            "--interval-ms",
            "250",
            "--budget-ms",
            "3000",
            "--format",
            "json",
            "--no-clear",
            "--log-file",
            "/tmp/cpuwatch.log",
        ])
        .unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run");
        };
        let mut config = PipelineConfig::default();
        args.apply(&mut config);
        assert_eq!(config.timing.sample_interval_ms, 250);
        assert_eq!(config.watchdog.allowed_unresponsive_ms, 3000);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert!(!config.output.clear_screen);
        assert_eq!(config.log.file, Some(PathBuf::from("/tmp/cpuwatch.log")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["cpuwatch", "--procstat", "/tmp/stat"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.procstat, Some(PathBuf::from("/tmp/stat")));
    }

    #[test]
    fn bad_format_is_rejected() {
        assert!(Cli::try_parse_from(["cpuwatch", "run", "--format", "xml"]).is_err());
    }
}
