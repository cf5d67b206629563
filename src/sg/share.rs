//! Kernel buffer-share link management.
//!
//! When both ends of the copy are sg devices the payload can stay in the
//! reader fd's reserved buffer: the writer fd is linked to it ("share") and
//! the kernel pairs a READ completion with the following WRITE by pack id,
//! never surfacing the data to user space. For a second destination the
//! slave side of the link is swapped mid-flight and restored afterwards.

use crate::sg::sys::*;
use nix::libc;
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

/// Link `slave_wr_fd`'s data buffer to `master_rd_fd`'s reserved buffer.
/// Returns false on failure; the caller falls back to an unshared copy for
/// the affected worker.
pub fn prepare(slave_wr_fd: RawFd, master_rd_fd: RawFd, id: usize) -> bool {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: SG_SEIM_SHARE_FD,
        sei_rd_mask: SG_SEIM_SHARE_FD,
        share_fd: master_rd_fd as u32,
        ..Default::default()
    };
    let res = unsafe { libc::ioctl(slave_wr_fd, SG_SET_GET_EXTENDED as libc::c_ulong, &mut sei) };
    if res < 0 {
        warn!(
            tid = id,
            master_fd = master_rd_fd,
            error = %std::io::Error::last_os_error(),
            "share setup ioctl failed"
        );
        return false;
    }
    debug!(tid = id, master_fd = master_rd_fd, slave_fd = slave_wr_fd, "share link established");
    true
}

/// Redirect the share link of `master_rd_fd` to `to_fd`.
///
/// With `before` set (ahead of a second-destination write) the master's
/// "finished" bit is cleared in the same ioctl, holding the master request
/// in its swap state so the new slave can consume the buffer. The kernel
/// returns EBUSY while the previous pairing is still completing, so the
/// ioctl is retried with a scheduler yield in between.
pub fn swap_to(master_rd_fd: RawFd, to_fd: RawFd, before: bool, id: usize) -> bool {
    let mut sei = SgExtendedInfo {
        sei_wr_mask: SG_SEIM_CHG_SHARE_FD,
        sei_rd_mask: SG_SEIM_CHG_SHARE_FD,
        share_fd: to_fd as u32,
        ..Default::default()
    };
    if before {
        sei.sei_wr_mask |= SG_SEIM_CTL_FLAGS;
        sei.sei_rd_mask |= SG_SEIM_CTL_FLAGS;
        sei.ctl_flags_wr_mask |= SG_CTL_FLAGM_MASTER_FINI;
        sei.ctl_flags &= SG_CTL_FLAGM_MASTER_FINI; /* would be 0 anyway */
    }
    let mut reported = false;
    loop {
        let res =
            unsafe { libc::ioctl(master_rd_fd, SG_SET_GET_EXTENDED as libc::c_ulong, &mut sei) };
        if res >= 0 {
            debug!(tid = id, master_fd = master_rd_fd, to_fd, before, "share swapped");
            return true;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EBUSY) {
            warn!(tid = id, to_fd, error = %err, "share swap ioctl failed");
            return false;
        }
        if !reported {
            debug!(tid = id, to_fd, "share swap busy, retrying");
            reported = true;
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_prepare_fails_cleanly_on_non_sg_fd() {
        let f = tempfile::tempfile().unwrap();
        assert!(!prepare(f.as_raw_fd(), f.as_raw_fd(), 0));
    }

    #[test]
    fn test_swap_fails_cleanly_on_non_sg_fd() {
        let f = tempfile::tempfile().unwrap();
        let g = tempfile::tempfile().unwrap();
        assert!(!swap_to(f.as_raw_fd(), g.as_raw_fd(), true, 0));
        assert!(!swap_to(f.as_raw_fd(), g.as_raw_fd(), false, 0));
    }
}
