//! Shared state visible to every worker thread.
//!
//! One [`GlobalState`] instance exists per copy. Each side's counters live
//! behind that side's mutex; the write-ordering condition variable is paired
//! with the output mutex. The two monotonic counters (`pos_index` for segment
//! assignment and `pack_id` for command tags) are plain atomics.

use crate::error::Category;
use crate::filetype::FileKind;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use tracing::debug;

/// Per-side flag set from `iflag=`/`oflag=` and the shorthand operands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideFlags {
    pub append: bool,
    pub coe: bool,
    pub defres: bool,
    pub dio: bool,
    pub direct: bool,
    pub dpo: bool,
    pub dsync: bool,
    pub excl: bool,
    pub fua: bool,
    pub mmap: bool,
    pub noshare: bool,
    pub noxfer: bool,
    pub same_fds: bool,
    pub swait: bool,
    pub v3: bool,
    pub v4: bool,
}

/// Input-side counters, guarded by the input mutex.
#[derive(Debug, Default)]
pub struct InCounters {
    /// Blocks still to be dispatched for reading.
    pub count: i64,
    /// Blocks not yet accounted as read-complete.
    pub rem: i64,
    /// 1 when the final segment ended in a short read.
    pub partial: u32,
    pub stop: bool,
    /// Direct IO requested but serviced indirect, read side.
    pub dio_incomplete: u32,
    /// Sum of read residuals reported by the device.
    pub resid_sum: i64,
}

/// Output-side counters, guarded by the output mutex. `blk` is the head of
/// the write stream the Ordering Gate compares against.
#[derive(Debug, Default)]
pub struct OutCounters {
    /// Next expected write LBA.
    pub blk: i64,
    pub count: i64,
    pub rem: i64,
    pub partial: u32,
    pub stop: bool,
    pub dio_incomplete: u32,
    pub resid_sum: i64,
}

/// Everything the workers share. Created once at startup, dropped at
/// teardown.
pub struct GlobalState {
    pub bs: usize,
    pub bpt: usize,
    /// Total blocks to copy; resolved before workers start.
    pub total: i64,
    pub skip: i64,
    pub seek: i64,
    /// Abort every nth command (0 disables).
    pub aen: u32,
    /// Scatter-gather element size hint, bytes.
    pub elem_sz: u32,
    pub cdbsz_in: usize,
    pub cdbsz_out: usize,
    pub debug: u8,

    pub in_fd: RawFd,
    pub in_kind: FileKind,
    pub in_flags: SideFlags,
    pub in_path: Option<PathBuf>,

    pub out_fd: RawFd,
    pub out_kind: FileKind,
    pub out_flags: SideFlags,
    pub out_path: Option<PathBuf>,

    pub out2_fd: Option<RawFd>,
    pub out2_kind: FileKind,
    pub out2_path: Option<PathBuf>,

    /// Ordinary file or pipe receiving a copy of every read payload.
    pub outreg_fd: Option<RawFd>,

    pub in_side: Mutex<InCounters>,
    pub out_side: Mutex<OutCounters>,
    /// Paired with `out_side`; holds writes until they are in order.
    pub out_order: Condvar,
    pub out2_lock: Mutex<()>,

    /// Next segment's offset in blocks from the start of the copy.
    pub pos_index: AtomicI64,
    /// Unique per-command tag source.
    pub pack_id: AtomicI32,

    exit_status: Mutex<Category>,
}

impl GlobalState {
    /// Fresh state with counters sized for `total` blocks.
    pub fn new(bs: usize, bpt: usize, total: i64, skip: i64, seek: i64) -> Self {
        Self {
            bs,
            bpt,
            total,
            skip,
            seek,
            aen: 0,
            elem_sz: 0,
            cdbsz_in: 10,
            cdbsz_out: 10,
            debug: 0,
            in_fd: -1,
            in_kind: FileKind::Stdin,
            in_flags: SideFlags::default(),
            in_path: None,
            out_fd: -1,
            out_kind: FileKind::Null,
            out_flags: SideFlags::default(),
            out_path: None,
            out2_fd: None,
            out2_kind: FileKind::Null,
            out2_path: None,
            outreg_fd: None,
            in_side: Mutex::new(InCounters {
                count: total,
                rem: total,
                ..Default::default()
            }),
            out_side: Mutex::new(OutCounters {
                blk: seek,
                count: total,
                rem: total,
                ..Default::default()
            }),
            out_order: Condvar::new(),
            out2_lock: Mutex::new(()),
            pos_index: AtomicI64::new(0),
            pack_id: AtomicI32::new(0),
            exit_status: Mutex::new(Category::Clean),
        }
    }

    /// Allocate the next unique command tag.
    #[inline]
    pub fn next_pack_id(&self) -> i32 {
        self.pack_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Record the first non-clean category; later reports do not overwrite
    /// it.
    pub fn note_exit(&self, cat: Category) {
        let mut status = self.exit_status.lock().unwrap();
        if *status == Category::Clean && cat != Category::Clean {
            debug!(?cat, "recording exit category");
            *status = cat;
        }
    }

    pub fn exit_status(&self) -> Category {
        *self.exit_status.lock().unwrap()
    }

    /// Set the input stop flag under its mutex.
    pub fn guarded_stop_in(&self) {
        self.in_side.lock().unwrap().stop = true;
    }

    /// Set the output stop flag under its mutex.
    pub fn guarded_stop_out(&self) {
        self.out_side.lock().unwrap().stop = true;
    }

    /// Stop both sides; peers blocked on the ordering gate are not woken
    /// here, callers broadcast when they want that.
    pub fn guarded_stop_both(&self) {
        self.guarded_stop_in();
        self.guarded_stop_out();
    }

    /// Stop both sides and release everyone waiting on the ordering gate.
    pub fn stop_and_broadcast(&self) {
        self.guarded_stop_both();
        self.out_order.notify_all();
    }

    /// True once either side has been told to stop.
    pub fn stopped(&self) -> bool {
        self.in_side.lock().unwrap().stop || self.out_side.lock().unwrap().stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_counters() {
        let gs = GlobalState::new(512, 128, 1000, 5, 9);
        let in_c = gs.in_side.lock().unwrap();
        assert_eq!(in_c.count, 1000);
        assert_eq!(in_c.rem, 1000);
        assert!(!in_c.stop);
        drop(in_c);
        let out_c = gs.out_side.lock().unwrap();
        assert_eq!(out_c.blk, 9);
        assert_eq!(out_c.count, 1000);
        assert_eq!(out_c.rem, 1000);
    }

    #[test]
    fn test_pack_ids_unique_and_increasing() {
        let gs = GlobalState::new(512, 128, 10, 0, 0);
        let a = gs.next_pack_id();
        let b = gs.next_pack_id();
        let c = gs.next_pack_id();
        assert!(a < b && b < c);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_first_exit_category_wins() {
        let gs = GlobalState::new(512, 128, 10, 0, 0);
        assert_eq!(gs.exit_status(), Category::Clean);
        gs.note_exit(Category::MediumHard);
        gs.note_exit(Category::Other);
        assert_eq!(gs.exit_status(), Category::MediumHard);
    }

    #[test]
    fn test_guarded_stops() {
        let gs = GlobalState::new(512, 128, 10, 0, 0);
        assert!(!gs.stopped());
        gs.guarded_stop_in();
        assert!(gs.stopped());
        gs.stop_and_broadcast();
        assert!(gs.in_side.lock().unwrap().stop);
        assert!(gs.out_side.lock().unwrap().stop);
    }
}
