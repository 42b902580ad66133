//! `/proc/stat` CPU counters.
//!
//! Only the `cpu` lines are read: the aggregate `cpu` line first, then one
//! `cpuN` line per processor. Each line carries up to ten jiffy counters;
//! older kernels omit the trailing ones, which then read as zero.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default counter file.
pub const DEFAULT_PROCSTAT_PATH: &str = "/proc/stat";

const MIN_FIELDS: usize = 4;
const MAX_FIELDS: usize = 10;

/// Errors reading or parsing a counter snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ProcStatError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("aggregate `cpu` line missing")]
    MissingTotal,

    #[error("line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    #[error("no per-cpu lines found")]
    NoCpus,
}

/// Jiffy counters of one `cpu` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

impl CpuTimes {
    /// Build from counters in `/proc/stat` column order.
    #[must_use]
    pub fn from_fields(fields: [u64; MAX_FIELDS]) -> Self {
        let [user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice] = fields;
        Self {
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
            guest,
            guest_nice,
        }
    }

    /// Time spent idle, including waiting on I/O.
    #[must_use]
    pub fn idle_total(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    /// Time spent doing work. Guest time is already folded into `user` and
    /// `nice` by the kernel, so it is not added again.
    #[must_use]
    pub fn busy_total(&self) -> u64 {
        [self.user, self.nice, self.system, self.irq, self.softirq, self.steal]
            .into_iter()
            .fold(0u64, u64::saturating_add)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.idle_total().saturating_add(self.busy_total())
    }
}

/// One snapshot of the counter file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStat {
    /// The aggregate `cpu` line.
    pub total: CpuTimes,
    /// One entry per `cpuN` line, in file order.
    pub cpus: Vec<CpuTimes>,
}

impl ProcStat {
    /// Parse the text of a counter file.
    pub fn parse(text: &str) -> Result<Self, ProcStatError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line))
            .filter(|(_, line)| line.starts_with("cpu"));

        let (line_no, first) = lines.next().ok_or(ProcStatError::MissingTotal)?;
        let (label, total) = parse_line(line_no, first)?;
        if label != "cpu" {
            return Err(ProcStatError::MissingTotal);
        }

        let mut cpus = Vec::new();
        for (line_no, line) in lines {
            let (label, times) = parse_line(line_no, line)?;
            let suffix = &label["cpu".len()..];
            if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProcStatError::MalformedLine {
                    line: line_no,
                    reason: format!("unexpected label `{label}`"),
                });
            }
            cpus.push(times);
        }

        if cpus.is_empty() {
            return Err(ProcStatError::NoCpus);
        }
        Ok(Self { total, cpus })
    }

    /// Number of per-cpu entries.
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }
}

fn parse_line(line_no: usize, line: &str) -> Result<(&str, CpuTimes), ProcStatError> {
    let mut parts = line.split_whitespace();
    let label = parts.next().unwrap_or_default();

    let mut fields = [0u64; MAX_FIELDS];
    let mut count = 0;
    for (slot, raw) in fields.iter_mut().zip(&mut parts) {
        *slot = raw.parse().map_err(|_| ProcStatError::MalformedLine {
            line: line_no,
            reason: format!("non-numeric counter `{raw}`"),
        })?;
        count += 1;
    }
    if count < MIN_FIELDS {
        return Err(ProcStatError::MalformedLine {
            line: line_no,
            reason: format!("expected at least {MIN_FIELDS} counters, found {count}"),
        });
    }
    Ok((label, CpuTimes::from_fields(fields)))
}

// =============================================================================
// Sample sources
// =============================================================================

/// Anything that can produce a counter snapshot.
pub trait SampleSource: Send {
    fn sample(&mut self) -> Result<ProcStat, ProcStatError>;
}

/// Reads snapshots from a counter file on every call.
#[derive(Debug, Clone)]
pub struct ProcStatFile {
    path: PathBuf,
}

impl ProcStatFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ProcStatFile {
    fn default() -> Self {
        Self::new(DEFAULT_PROCSTAT_PATH)
    }
}

impl SampleSource for ProcStatFile {
    fn sample(&mut self) -> Result<ProcStat, ProcStatError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ProcStatError::Io {
            path: self.path.clone(),
            source,
        })?;
        ProcStat::parse(&text)
    }
}

/// Number of processors: `cpuN` lines of `path` when readable, else the
/// platform's available parallelism, else 1.
#[must_use]
pub fn detect_cpu_count(path: &Path) -> usize {
    if let Ok(stat) = ProcStatFile::new(path).sample() {
        return stat.cpu_count();
    }
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
