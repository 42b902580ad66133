//! Sampler stage: reads a counter snapshot on a fixed cadence and hands it
//! to the Analyzer.

use std::time::Duration;

use tracing::{debug, error};

use crate::handoff::Producer;
use crate::procstat::{ProcStat, SampleSource};
use crate::stage::{Produced, StageContext, WorkerExit};

/// Sampler loop. A failed read is logged and retried on the next cycle.
///
/// The inter-sample delay is sliced by the lock timeout; every slice
/// heartbeats, so any interval below the watchdog budget keeps the Sampler
/// healthy, and cancellation is seen promptly.
pub fn run_sampler<S>(
    mut ctx: StageContext,
    source: &mut S,
    output: &Producer<ProcStat>,
    interval: Duration,
) -> WorkerExit
where
    S: SampleSource + ?Sized,
{
    let worker = ctx.worker();
    while ctx.begin_iteration() {
        match source.sample() {
            Ok(stat) => {
                debug!(worker = %worker, cpus = stat.cpu_count(), "Sampled counters");
                if ctx.produce(output, stat) == Produced::Cancelled {
                    break;
                }
            }
            Err(err) => {
                ctx.stats_mut().errors += 1;
                error!(worker = %worker, error = %err, "Sample failed, retrying next cycle");
            }
        }
        if ctx.pause(interval) {
            break;
        }
    }
    output.wake();
    ctx.finish()
}
