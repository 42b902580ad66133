//! Error types for cpuwatch-core

use std::fmt::Write;
use thiserror::Error;

use crate::bounded_queue::QueueError;
use crate::config::ConfigError;
use crate::logging::LogError;
use crate::procstat::ProcStatError;
use crate::sync::AcquireError;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cpuwatch-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Lock error: {0}")]
    Acquire(#[from] AcquireError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sample error: {0}")]
    ProcStat(#[from] ProcStatError),

    #[error("Logging error: {0}")]
    Log(#[from] LogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker thread could not be started or joined
    #[error("Setup error: {0}")]
    Setup(String),
}

impl Error {
    /// Human guidance for resolving this error, when there is any.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Queue(QueueError::ZeroCapacity) => Some(
                Remediation::new("Set every [queues] capacity to at least 1.")
                    .command("Show effective config", "cpuwatch config"),
            ),
            Self::Queue(QueueError::AllocationFailed { .. }) => Some(
                Remediation::new("Lower the [queues] capacities; the requested storage is too large.")
                    .command("Show effective config", "cpuwatch config"),
            ),
            Self::Acquire(_) => None,
            Self::Config(ConfigError::Read { .. }) => Some(
                Remediation::new("Check the --config path and its permissions.")
                    .alternative("Omit --config to use built-in defaults."),
            ),
            Self::Config(_) => Some(
                Remediation::new("Fix the reported key in cpuwatch.toml.")
                    .command("Show effective config", "cpuwatch config")
                    .alternative("Delete the file to fall back to defaults."),
            ),
            Self::ProcStat(ProcStatError::Io { .. }) => Some(
                Remediation::new("cpuwatch reads Linux /proc/stat; make sure procfs is mounted.")
                    .command("Check procfs", "head -n 3 /proc/stat")
                    .alternative("Point --procstat at a readable snapshot file."),
            ),
            Self::ProcStat(_) => Some(
                Remediation::new("The counter file is not in /proc/stat format.")
                    .command("Inspect", "cpuwatch sample"),
            ),
            Self::Log(_) => Some(
                Remediation::new("Check the [log] section and that the log directory is writable.")
                    .alternative("Use RUST_LOG to override the level, e.g. RUST_LOG=debug."),
            ),
            Self::Io(_) => Some(Remediation::new(
                "Check filesystem permissions and paths, then retry.",
            )),
            Self::Json(_) | Self::Setup(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_render_plain() {
        let text = Remediation::new("Do the thing.")
            .command("Check", "cpuwatch config")
            .alternative("Or not.")
            .render_plain();
        assert!(text.starts_with("To fix:\n  Do the thing.\n"));
        assert!(text.contains("    - Check: cpuwatch config\n"));
        assert!(text.contains("  Alternatives:\n    - Or not.\n"));
    }

    #[test]
    fn conversions_and_display() {
        let err: Error = QueueError::ZeroCapacity.into();
        assert_eq!(
            err.to_string(),
            "Queue error: queue capacity must be greater than zero"
        );
        let err: Error = ProcStatError::NoCpus.into();
        assert!(err.to_string().starts_with("Sample error"));
    }

    #[test]
    fn remediation_targets() {
        let err: Error = ConfigError::Invalid("x".into()).into();
        assert!(err.remediation().unwrap().summary.contains("cpuwatch.toml"));

        let err: Error = ProcStatError::Io {
            path: "/proc/stat".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .into();
        assert!(err.remediation().unwrap().summary.contains("procfs"));

        assert!(Error::Setup("spawn".into()).remediation().is_none());
    }

    #[test]
    fn remediation_serializes() {
        let json = serde_json::to_string(&Remediation::new("x").command("a", "b")).unwrap();
        assert!(json.contains("\"commands\":[{\"label\":\"a\",\"command\":\"b\"}]"));
    }
}
