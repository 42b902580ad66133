#![no_main]

use cpuwatch_core::procstat::ProcStat;
use cpuwatch_core::usage::CpuUsage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(stat) = ProcStat::parse(text) else {
        return;
    };
    assert!(stat.cpu_count() > 0);

    // Any parsed snapshot must survive the utilization math against itself
    // and against a zeroed predecessor without panicking or leaving [0, 100].
    let zero = ProcStat {
        total: Default::default(),
        cpus: vec![Default::default(); stat.cpu_count()],
    };
    for usage in [CpuUsage::between(&stat, &stat), CpuUsage::between(&zero, &stat)] {
        for pct in std::iter::once(usage.total).chain(usage.cpus).flatten() {
            assert!((0.0..=100.0).contains(&pct));
        }
    }
});
