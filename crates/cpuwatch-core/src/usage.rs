//! Percentage utilization between two counter snapshots.

use serde::{Deserialize, Serialize};

use crate::procstat::{CpuTimes, ProcStat};

/// Busy share of the elapsed jiffies between `prev` and `next`, in percent.
///
/// `None` when no time elapsed or when a counter went backwards (counter
/// reset, cpu hot-plug).
#[must_use]
pub fn utilization(prev: &CpuTimes, next: &CpuTimes) -> Option<f64> {
    let total_d = next.total().checked_sub(prev.total())?;
    let idle_d = next.idle_total().checked_sub(prev.idle_total())?;
    let busy_d = next.busy_total().checked_sub(prev.busy_total())?;
    if total_d == 0 || idle_d > total_d {
        return None;
    }
    let pct = busy_d as f64 / total_d as f64 * 100.0;
    Some(pct.clamp(0.0, 100.0))
}

/// Derived utilization record: aggregate plus one entry per processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub total: Option<f64>,
    pub cpus: Vec<Option<f64>>,
}

impl CpuUsage {
    /// Utilization between two consecutive snapshots.
    ///
    /// Processors present in only one snapshot read as `None`.
    #[must_use]
    pub fn between(prev: &ProcStat, next: &ProcStat) -> Self {
        let cpus = next
            .cpus
            .iter()
            .enumerate()
            .map(|(i, n)| prev.cpus.get(i).and_then(|p| utilization(p, n)))
            .collect();
        Self {
            total: utilization(&prev.total, &next.total),
            cpus,
        }
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(busy: u64, idle: u64) -> CpuTimes {
        CpuTimes {
            user: busy,
            idle,
            ..CpuTimes::default()
        }
    }

    #[test]
    fn half_busy() {
        let pct = utilization(&times(100, 100), &times(150, 150)).unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn iowait_counts_as_idle() {
        let prev = CpuTimes::default();
        let next = CpuTimes {
            user: 25,
            idle: 50,
            iowait: 25,
            ..CpuTimes::default()
        };
        let pct = utilization(&prev, &next).unwrap();
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn fully_busy_and_fully_idle() {
        assert_eq!(utilization(&times(0, 0), &times(10, 0)), Some(100.0));
        assert_eq!(utilization(&times(0, 0), &times(0, 10)), Some(0.0));
    }

    #[test]
    fn zero_delta_is_no_data() {
        assert_eq!(utilization(&times(5, 5), &times(5, 5)), None);
    }

    #[test]
    fn regression_is_no_data() {
        assert_eq!(utilization(&times(100, 100), &times(50, 200)), None);
        assert_eq!(utilization(&times(100, 100), &times(200, 50)), None);
    }

    #[test]
    fn between_handles_hotplug() {
        let prev = ProcStat {
            total: times(0, 0),
            cpus: vec![times(0, 0)],
        };
        let next = ProcStat {
            total: times(10, 10),
            cpus: vec![times(5, 5), times(3, 3)],
        };
        let usage = CpuUsage::between(&prev, &next);
        assert_eq!(usage.total, Some(50.0));
        assert_eq!(usage.cpus, vec![Some(50.0), None]);
        assert_eq!(usage.cpu_count(), 2);
    }

    #[test]
    fn serializes_none_as_null() {
        let usage = CpuUsage {
            total: None,
            cpus: vec![Some(1.5)],
        };
        let json = serde_json::to_string(&usage).unwrap();
        assert_eq!(json, r#"{"total":null,"cpus":[1.5]}"#);
    }
}
