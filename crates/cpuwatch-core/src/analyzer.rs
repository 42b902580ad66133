//! Analyzer stage: turns consecutive counter snapshots into utilization.

use tracing::debug;

use crate::handoff::{Consumer, Producer};
use crate::procstat::ProcStat;
use crate::stage::{Consumed, Produced, StageContext, WorkerExit};
use crate::usage::CpuUsage;

/// Analyzer loop.
///
/// The first snapshot is only cached. Every later one yields one
/// [`CpuUsage`] computed against its predecessor.
pub fn run_analyzer(
    mut ctx: StageContext,
    input: &Consumer<ProcStat>,
    output: &Producer<CpuUsage>,
) -> WorkerExit {
    let worker = ctx.worker();
    let mut previous: Option<ProcStat> = None;

    while ctx.begin_iteration() {
        let current = match ctx.consume(input) {
            Consumed::Item(stat) => stat,
            Consumed::NoData => continue,
            Consumed::Cancelled => break,
        };
        let Some(prev) = previous.take() else {
            debug!(worker = %worker, "First sample cached");
            previous = Some(current);
            continue;
        };

        let usage = CpuUsage::between(&prev, &current);
        previous = Some(current);
        debug!(worker = %worker, total = ?usage.total, "Computed utilization");
        if ctx.produce(output, usage) == Produced::Cancelled {
            break;
        }
    }
    input.wake();
    output.wake();
    ctx.finish()
}
