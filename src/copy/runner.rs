//! Worker lifecycle: staged thread start, join, and post-copy cache sync.
//!
//! One bootstrap worker runs first to shake out infant-retryable conditions
//! (unit attentions from a fresh open, share setup failures); once it signals
//! the ordering condvar the remaining workers start.

use crate::copy::state::GlobalState;
use crate::copy::worker;
use crate::error::Category;
use crate::filetype::FileKind;
use crate::scsi::cmds;
use std::sync::Arc;
use tracing::{debug, warn};

/// Run the copy across `num_threads` workers and wait for all of them.
pub fn run_copy(gs: &Arc<GlobalState>, num_threads: usize) {
    {
        let out_c = gs.out_side.lock().unwrap();
        if out_c.rem <= 0 || num_threads == 0 {
            return;
        }
    }

    let mut handles = Vec::with_capacity(num_threads);

    // Run one worker first and hold the output mutex until it signals the
    // ordering condvar (first segment gated, or thread exit).
    let guard = gs.out_side.lock().unwrap();
    let gs0 = gs.clone();
    let h0 = std::thread::Builder::new()
        .name("sgdd-worker-0".into())
        .spawn(move || worker::run(gs0, 0))
        .expect("spawn worker thread");
    handles.push(h0);
    let guard = gs.out_order.wait(guard).unwrap();
    drop(guard);

    for id in 1..num_threads {
        let gsn = gs.clone();
        let h = std::thread::Builder::new()
            .name(format!("sgdd-worker-{id}"))
            .spawn(move || worker::run(gsn, id))
            .expect("spawn worker thread");
        handles.push(h);
    }

    for (id, h) in handles.into_iter().enumerate() {
        if h.join().is_err() {
            warn!(tid = id, "worker thread panicked");
            gs.note_exit(Category::Other);
            gs.stop_and_broadcast();
        } else {
            debug!(tid = id, "worker thread terminated");
        }
    }
}

/// SYNCHRONIZE CACHE on the sg outputs, retrying once on unit attention.
pub fn sync_caches(gs: &GlobalState) {
    if gs.out_kind == FileKind::Sg {
        sync_one(gs.out_fd, "output");
    }
    if gs.out2_kind == FileKind::Sg {
        if let Some(fd) = gs.out2_fd {
            sync_one(fd, "second output");
        }
    }
}

fn sync_one(fd: i32, which: &str) {
    eprintln!(">> Synchronizing cache on {which}");
    match cmds::sync_cache(fd) {
        Ok(()) => {}
        Err(e) if e.is_unit_attention() => {
            warn!(which, "unit attention on cache sync, retrying");
            if let Err(e) = cmds::sync_cache(fd) {
                warn!(which, error = %e, "unable to synchronize cache");
            }
        }
        Err(e) => warn!(which, error = %e, "unable to synchronize cache"),
    }
}
