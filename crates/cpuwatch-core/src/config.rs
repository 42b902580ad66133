//! Pipeline configuration (`cpuwatch.toml`).
//!
//! Every section is optional; missing keys take the defaults below. Unknown
//! keys are rejected so typos surface at startup instead of silently falling
//! back to a default.
//!
//! ```toml
//! [queues]
//! raw_capacity = 10
//! usage_capacity = 4
//! log_capacity = 100
//!
//! [timing]
//! lock_timeout_ms = 50
//! wait_timeout_ms = 2000
//! sample_interval_ms = 500
//!
//! [watchdog]
//! allowed_unresponsive_ms = 2000
//! lock_timeout_ms = 50
//!
//! [source]
//! procstat_path = "/proc/stat"
//!
//! [output]
//! format = "text"
//! clear_screen = true
//!
//! [log]
//! level = "info"
//! format = "pretty"
//! file = "cut_log.txt"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;
use crate::procstat::DEFAULT_PROCSTAT_PATH;
use crate::stage::StageTiming;
use crate::watchdog::WatchdogConfig;

/// Config file name under the platform config directory.
pub const CONFIG_FILE_NAME: &str = "cpuwatch.toml";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// =============================================================================
// Formats
// =============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Console output format for utilization records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {s}. Expected one of: text, json")),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Capacities of the three bounded queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Sampler -> Analyzer.
    pub raw_capacity: usize,
    /// Analyzer -> Renderer.
    pub usage_capacity: usize,
    /// Log sink lines awaiting the Logger.
    pub log_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            raw_capacity: 10,
            usage_capacity: 4,
            log_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub lock_timeout_ms: u64,
    pub wait_timeout_ms: u64,
    pub sample_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 50,
            wait_timeout_ms: 2000,
            sample_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogSection {
    pub allowed_unresponsive_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            allowed_unresponsive_ms: 2000,
            lock_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub procstat_path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            procstat_path: PathBuf::from(DEFAULT_PROCSTAT_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// Clear the terminal before each text frame.
    pub clear_screen: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            clear_screen: true,
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub queues: QueueConfig,
    pub timing: TimingConfig,
    pub watchdog: WatchdogSection,
    pub source: SourceConfig,
    pub output: OutputConfig,
    pub log: LogConfig,
}

impl PipelineConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// `path` when given, else the default config file when it exists, else
    /// built-in defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/cpuwatch/cpuwatch.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cpuwatch").join(CONFIG_FILE_NAME))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queues;
        for (name, value) in [
            ("queues.raw_capacity", q.raw_capacity),
            ("queues.usage_capacity", q.usage_capacity),
            ("queues.log_capacity", q.log_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        let t = &self.timing;
        let w = &self.watchdog;
        for (name, value) in [
            ("timing.lock_timeout_ms", t.lock_timeout_ms),
            ("timing.wait_timeout_ms", t.wait_timeout_ms),
            ("timing.sample_interval_ms", t.sample_interval_ms),
            ("watchdog.allowed_unresponsive_ms", w.allowed_unresponsive_ms),
            ("watchdog.lock_timeout_ms", w.lock_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        if w.allowed_unresponsive_ms <= w.lock_timeout_ms
            || w.allowed_unresponsive_ms <= t.lock_timeout_ms
        {
            return Err(ConfigError::Invalid(
                "watchdog.allowed_unresponsive_ms must exceed both lock timeouts".to_string(),
            ));
        }
        if t.sample_interval_ms >= w.allowed_unresponsive_ms {
            return Err(ConfigError::Invalid(
                "timing.sample_interval_ms must be below watchdog.allowed_unresponsive_ms"
                    .to_string(),
            ));
        }

        self.log
            .level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::Invalid)?;
        Ok(())
    }

    #[must_use]
    pub fn stage_timing(&self) -> StageTiming {
        StageTiming {
            lock_timeout: Duration::from_millis(self.timing.lock_timeout_ms),
            wait_timeout: Duration::from_millis(self.timing.wait_timeout_ms),
        }
    }

    #[must_use]
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            allowed_unresponsive: Duration::from_millis(self.watchdog.allowed_unresponsive_ms),
            lock_timeout: Duration::from_millis(self.watchdog.lock_timeout_ms),
            wait_timeout: Duration::from_millis(self.timing.wait_timeout_ms),
        }
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.timing.sample_interval_ms)
    }
}
