//! Signal-driven lifecycle control.
//!
//! The interesting signals are blocked in every thread and consumed by one
//! dedicated listener thread via `sigwait`, which may safely take locks:
//! SIGINT stops both sides and releases the ordering gate, SIGUSR1 prints a
//! progress snapshot, SIGUSR2 additionally broadcasts the ordering condvar
//! (a recovery aid for a stuck gate), and SIGQUIT/SIGPIPE dump statistics
//! and re-raise themselves with the default disposition.

use crate::copy::state::GlobalState;
use crate::stats;
use nix::sys::pthread::{pthread_kill, Pthread};
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, warn};

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Block the handled signals in the calling thread; every thread spawned
/// afterwards inherits the mask. Call before any worker exists.
pub fn block_signals() -> nix::Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGUSR1);
    set.add(Signal::SIGUSR2);
    set.add(Signal::SIGQUIT);
    set.add(Signal::SIGPIPE);
    set.thread_block()?;
    Ok(set)
}

/// Handle to the listener thread.
pub struct SignalListener {
    handle: JoinHandle<()>,
    tid: Pthread,
}

impl SignalListener {
    /// Tell the listener to exit and wait for it. The wakeup signal is
    /// delivered to the listener thread, where `sigwait` consumes it.
    pub fn shutdown(self) {
        SHUTTING_DOWN.store(true, Ordering::SeqCst);
        if let Err(e) = pthread_kill(self.tid, Signal::SIGINT) {
            warn!(error = %e, "could not signal listener thread");
            return;
        }
        let _ = self.handle.join();
    }
}

/// Start the listener thread over an already-blocked signal set.
pub fn spawn_listener(
    set: SigSet,
    gs: Arc<GlobalState>,
    start: Instant,
    do_time: bool,
) -> SignalListener {
    let (tid_tx, tid_rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("sgdd-signals".into())
        .spawn(move || {
            let _ = tid_tx.send(nix::sys::pthread::pthread_self());
            listen(set, &gs, start, do_time)
        })
        .expect("spawn signal listener");
    let tid = tid_rx.recv().expect("listener thread id");
    SignalListener { handle, tid }
}

fn listen(set: SigSet, gs: &GlobalState, start: Instant, do_time: bool) {
    loop {
        let sig = match set.wait() {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "sigwait failed");
                continue;
            }
        };
        if SHUTTING_DOWN.load(Ordering::SeqCst) {
            debug!("signal listener shutting down");
            return;
        }
        match sig {
            Signal::SIGINT => {
                eprintln!("sgdd: interrupted by SIGINT");
                gs.stop_and_broadcast();
            }
            Signal::SIGUSR1 => {
                eprintln!("Progress report, continuing ...");
                if do_time {
                    stats::print_throughput(gs, start, true);
                }
                stats::print_stats("  ", gs);
            }
            Signal::SIGUSR2 => {
                eprintln!("Progress report, continuing ...");
                if do_time {
                    stats::print_throughput(gs, start, true);
                }
                stats::print_stats("  ", gs);
                eprintln!("Send broadcast on write-ordering condition variable");
                gs.out_order.notify_all();
            }
            Signal::SIGQUIT | Signal::SIGPIPE => {
                eprintln!("sgdd: interrupted by signal,");
                if do_time {
                    stats::print_throughput(gs, start, false);
                }
                stats::print_stats("", gs);
                reraise_default(sig);
            }
            other => {
                debug!(signal = %other, "ignoring unexpected signal");
            }
        }
    }
}

/// Restore the default disposition, unblock and re-raise: the process dies
/// the way the shell expects.
fn reraise_default(sig: Signal) {
    unsafe {
        if let Err(e) = signal::signal(sig, SigHandler::SigDfl) {
            warn!(error = %e, "could not reset signal disposition");
        }
    }
    let mut only = SigSet::empty();
    only.add(sig);
    if let Err(e) = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&only), None) {
        warn!(error = %e, "could not unblock signal");
    }
    let _ = signal::raise(sig);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_starts_and_shuts_down() {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.thread_block().unwrap();
        let gs = Arc::new(GlobalState::new(512, 128, 4, 0, 0));
        let listener = spawn_listener(set, gs, Instant::now(), false);
        listener.shutdown();
    }
}
