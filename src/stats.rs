//! Classical dd statistics: `full+partial records in/out`, plus elapsed
//! time and throughput.

use crate::copy::state::GlobalState;
use std::time::Instant;

/// Snapshot of the counters needed for reporting; taken with one short lock
/// per side.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub in_rem: i64,
    pub in_partial: u32,
    pub out_rem: i64,
    pub out_partial: u32,
    pub dio_incomplete: u32,
    pub resid_sum: i64,
}

impl Snapshot {
    pub fn take(gs: &GlobalState) -> Self {
        let (in_rem, in_partial, in_dio, in_resid) = {
            let c = gs.in_side.lock().unwrap();
            (c.rem, c.partial, c.dio_incomplete, c.resid_sum)
        };
        let (out_rem, out_partial, out_dio, out_resid) = {
            let c = gs.out_side.lock().unwrap();
            (c.rem, c.partial, c.dio_incomplete, c.resid_sum)
        };
        Self {
            in_rem,
            in_partial,
            out_rem,
            out_partial,
            dio_incomplete: in_dio + out_dio,
            resid_sum: in_resid + out_resid,
        }
    }
}

/// Print the dd-style record counts to stderr. `prefix` indents progress
/// reports.
pub fn print_stats(prefix: &str, gs: &GlobalState) {
    let snap = Snapshot::take(gs);
    if snap.out_rem != 0 {
        eprintln!("  remaining block count={}", snap.out_rem);
    }
    let infull = gs.total - snap.in_rem;
    eprintln!(
        "{prefix}{}+{} records in",
        infull - i64::from(snap.in_partial),
        snap.in_partial
    );
    let outfull = gs.total - snap.out_rem;
    eprintln!(
        "{prefix}{}+{} records out",
        outfull - i64::from(snap.out_partial),
        snap.out_partial
    );
}

/// Print elapsed wall time and the derived MB/s figure.
pub fn print_throughput(gs: &GlobalState, start: Instant, continuing: bool) {
    let elapsed = start.elapsed();
    let secs = elapsed.as_secs_f64();
    let out_rem = gs.out_side.lock().unwrap().rem;
    let bytes = gs.bs as f64 * (gs.total - out_rem) as f64;
    let verb = if continuing { "so far" } else { "was" };
    if secs > 0.00001 && bytes > 511.0 {
        eprintln!(
            "time to transfer data {verb} {secs:.6} secs, {:.2} MB/sec",
            bytes / (secs * 1_000_000.0)
        );
    } else {
        eprintln!("time to transfer data {verb} {secs:.6} secs");
    }
}
