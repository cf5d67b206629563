//! One-command submit/receive over the sg driver's async interfaces.
//!
//! The v3 interface submits a request by writing an [`SgIoHdr`] to the fd and
//! collects the completion by reading one back; the v4 interface uses the
//! SG_IOSUBMIT and SG_IORECEIVE ioctls with an [`SgIoV4`]. Completions are
//! matched to requests by pack id (the fds are opened with force-pack-id
//! enabled) and classified into a small set of outcomes that drive the copy
//! engine's retry loop.

use crate::error::Category;
use crate::scsi::cdb::MAX_CDB_SZ;
use crate::scsi::sense;
use crate::sg::sys::*;
use nix::libc;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Which sg interface generation a side uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iface {
    V3,
    V4,
}

/// Data transfer direction of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    FromDev,
    ToDev,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Submission hit ENOMEM; the reserved buffer is saturated.
    #[error("out of memory submitting sg request")]
    OutOfMemory,

    #[error("sg submit failed: {0}")]
    Submit(std::io::Error),

    #[error("sg receive failed: {0}")]
    Receive(std::io::Error),

    /// Completion carried a different pack id than the one requested.
    #[error("request-response mismatch: expected pack id {expected}, got {got}")]
    PackIdMismatch { expected: i32, got: i32 },
}

/// Classified command completion, the retry taxonomy of the copy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No device, transport or driver error.
    Clean,
    /// Recovered-error sense; logged and treated as clean.
    Recovered,
    /// Retry the same segment.
    AbortedCommand,
    /// Retry the same segment.
    UnitAttention,
    /// Fatal unless continue-on-error is set for the side.
    MediumHard,
    /// Fatal.
    NotReady,
    /// Everything else; fatal. Carries the precise category for the exit
    /// status.
    Other(Category),
}

impl Outcome {
    pub fn from_category(cat: Category) -> Self {
        match cat {
            Category::Clean => Outcome::Clean,
            Category::Recovered => Outcome::Recovered,
            Category::AbortedCommand => Outcome::AbortedCommand,
            Category::UnitAttention => Outcome::UnitAttention,
            Category::MediumHard => Outcome::MediumHard,
            Category::NotReady => Outcome::NotReady,
            other => Outcome::Other(other),
        }
    }

    /// The exit category this outcome maps back to.
    pub fn category(self) -> Category {
        match self {
            Outcome::Clean => Category::Clean,
            Outcome::Recovered => Category::Recovered,
            Outcome::AbortedCommand => Category::AbortedCommand,
            Outcome::UnitAttention => Category::UnitAttention,
            Outcome::MediumHard => Category::MediumHard,
            Outcome::NotReady => Category::NotReady,
            Outcome::Other(cat) => cat,
        }
    }

    /// True for outcomes retried with the same segment.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Outcome::AbortedCommand | Outcome::UnitAttention)
    }

    /// True when the transfer counts as done.
    #[inline]
    pub fn is_clean(self) -> bool {
        matches!(self, Outcome::Clean | Outcome::Recovered)
    }
}

/// Per-command state that must stay alive from submit to receive: the CDB
/// bytes the kernel reads at submit time and the sense buffer it fills at
/// completion time. One instance per in-flight command.
#[derive(Debug, Clone)]
pub struct CommandScratch {
    pub cdb: [u8; MAX_CDB_SZ],
    pub cdb_len: usize,
    pub sense: [u8; SENSE_BUFF_LEN],
}

impl CommandScratch {
    pub fn new() -> Self {
        Self {
            cdb: [0; MAX_CDB_SZ],
            cdb_len: 0,
            sense: [0; SENSE_BUFF_LEN],
        }
    }
}

impl Default for CommandScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// A classified completion together with its residual accounting.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub outcome: Outcome,
    /// Bytes the device reported as not transferred.
    pub resid: i32,
    /// Direct IO was requested but serviced as indirect.
    pub dio_incomplete: bool,
    /// Raw driver info bits for diagnostics.
    pub info: u32,
}

/// Retry a syscall-shaped closure on EINTR/EAGAIN, yielding between attempts
/// so another worker can progress.
fn retry_intr<F>(mut f: F) -> libc::ssize_t
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        let res = f();
        if res < 0 {
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => {
                    std::thread::yield_now();
                    continue;
                }
                _ => return res,
            }
        }
        return res;
    }
}

/// Submit one command. `buf`/`len` describe the data buffer; with NO_DXFER
/// flags the kernel still wants the length for sizing, so they are passed
/// regardless. Returns after the kernel has queued the request.
#[allow(clippy::too_many_arguments)]
pub fn submit(
    fd: RawFd,
    iface: Iface,
    dir: Dir,
    scratch: &mut CommandScratch,
    buf: *mut u8,
    len: usize,
    flags: u32,
    pack_id: i32,
) -> Result<(), TransportError> {
    match iface {
        Iface::V3 => submit_v3(fd, dir, scratch, buf, len, flags, pack_id),
        Iface::V4 => submit_v4(fd, dir, scratch, buf, len, flags, pack_id),
    }
}

fn submit_v3(
    fd: RawFd,
    dir: Dir,
    scratch: &mut CommandScratch,
    buf: *mut u8,
    len: usize,
    flags: u32,
    pack_id: i32,
) -> Result<(), TransportError> {
    let hdr = SgIoHdr {
        cmd_len: scratch.cdb_len as u8,
        cmdp: scratch.cdb.as_mut_ptr(),
        dxfer_direction: match dir {
            Dir::ToDev => SG_DXFER_TO_DEV,
            Dir::FromDev => SG_DXFER_FROM_DEV,
        },
        dxfer_len: len as u32,
        dxferp: buf.cast(),
        mx_sb_len: SENSE_BUFF_LEN as u8,
        sbp: scratch.sense.as_mut_ptr(),
        timeout: DEF_TIMEOUT_MS,
        pack_id,
        flags,
        ..Default::default()
    };
    let res = retry_intr(|| unsafe {
        libc::write(
            fd,
            std::ptr::addr_of!(hdr).cast(),
            std::mem::size_of::<SgIoHdr>(),
        )
    });
    map_submit_result(res)
}

fn submit_v4(
    fd: RawFd,
    dir: Dir,
    scratch: &mut CommandScratch,
    buf: *mut u8,
    len: usize,
    flags: u32,
    pack_id: i32,
) -> Result<(), TransportError> {
    let mut h4 = SgIoV4 {
        guard: SG_GUARD_V4,
        request_len: scratch.cdb_len as u32,
        request: scratch.cdb.as_mut_ptr() as u64,
        max_response_len: SENSE_BUFF_LEN as u32,
        response: scratch.sense.as_mut_ptr() as u64,
        timeout: DEF_TIMEOUT_MS,
        request_extra: pack_id as u32,
        flags,
        ..Default::default()
    };
    match dir {
        Dir::ToDev => {
            h4.dout_xfer_len = len as u32;
            h4.dout_xferp = buf as u64;
        }
        Dir::FromDev if len > 0 => {
            h4.din_xfer_len = len as u32;
            h4.din_xferp = buf as u64;
        }
        Dir::FromDev => {}
    }
    let res = retry_intr(|| {
        unsafe { libc::ioctl(fd, SG_IOSUBMIT as libc::c_ulong, &mut h4) as libc::ssize_t }
    });
    map_submit_result(res)
}

fn map_submit_result(res: libc::ssize_t) -> Result<(), TransportError> {
    if res < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOMEM) {
            return Err(TransportError::OutOfMemory);
        }
        return Err(TransportError::Submit(err));
    }
    Ok(())
}

/// Collect the completion for `pack_id` and classify it. `dio_requested`
/// controls the direct-IO bookkeeping of the completion.
pub fn receive(
    fd: RawFd,
    iface: Iface,
    dir: Dir,
    scratch: &mut CommandScratch,
    pack_id: i32,
    dio_requested: bool,
) -> Result<Completion, TransportError> {
    match iface {
        Iface::V3 => receive_v3(fd, dir, scratch, pack_id, dio_requested),
        Iface::V4 => receive_v4(fd, dir, scratch, pack_id, dio_requested),
    }
}

fn receive_v3(
    fd: RawFd,
    dir: Dir,
    scratch: &mut CommandScratch,
    pack_id: i32,
    dio_requested: bool,
) -> Result<Completion, TransportError> {
    // With force-pack-id active the driver only hands back the matching
    // completion; the wanted id travels in the header given to read(2).
    let mut hdr = SgIoHdr {
        dxfer_direction: match dir {
            Dir::ToDev => SG_DXFER_TO_DEV,
            Dir::FromDev => SG_DXFER_FROM_DEV,
        },
        pack_id,
        ..Default::default()
    };
    let res = retry_intr(|| unsafe {
        libc::read(
            fd,
            std::ptr::addr_of_mut!(hdr).cast(),
            std::mem::size_of::<SgIoHdr>(),
        )
    });
    if res < 0 {
        return Err(TransportError::Receive(std::io::Error::last_os_error()));
    }
    if hdr.pack_id != pack_id {
        return Err(TransportError::PackIdMismatch {
            expected: pack_id,
            got: hdr.pack_id,
        });
    }
    let sb = &scratch.sense[..(hdr.sb_len_wr as usize).min(SENSE_BUFF_LEN)];
    let cat = sense::categorize(hdr.status, hdr.host_status, hdr.driver_status, sb);
    Ok(Completion {
        outcome: Outcome::from_category(cat),
        resid: hdr.resid,
        dio_incomplete: dio_requested
            && (hdr.info & SG_INFO_DIRECT_IO_MASK) != SG_INFO_DIRECT_IO,
        info: hdr.info,
    })
}

fn receive_v4(
    fd: RawFd,
    dir: Dir,
    scratch: &mut CommandScratch,
    pack_id: i32,
    dio_requested: bool,
) -> Result<Completion, TransportError> {
    let mut h4 = SgIoV4 {
        guard: SG_GUARD_V4,
        request_extra: pack_id as u32,
        ..Default::default()
    };
    let res = retry_intr(|| {
        unsafe { libc::ioctl(fd, SG_IORECEIVE as libc::c_ulong, &mut h4) as libc::ssize_t }
    });
    if res < 0 {
        return Err(TransportError::Receive(std::io::Error::last_os_error()));
    }
    if h4.request_extra != pack_id as u32 {
        return Err(TransportError::PackIdMismatch {
            expected: pack_id,
            got: h4.request_extra as i32,
        });
    }
    let sb_len = (h4.response_len as usize).min(SENSE_BUFF_LEN);
    let sb = &scratch.sense[..sb_len];
    let cat = sense::categorize(
        h4.device_status as u8,
        h4.transport_status as u16,
        h4.driver_status as u16,
        sb,
    );
    let resid = match dir {
        Dir::FromDev => h4.din_resid,
        Dir::ToDev => h4.dout_resid,
    };
    Ok(Completion {
        outcome: Outcome::from_category(cat),
        resid,
        dio_incomplete: dio_requested && (h4.info & SG_INFO_DIRECT_IO) == 0,
        info: h4.info,
    })
}

/// Abort-every-nth support: poll the fd for a completion for one
/// millisecond; when the command is still in flight, abort it by pack id.
/// Only meaningful on the v4 interface.
pub fn abort_if_inflight(fd: RawFd, pack_id: i32) {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let res = unsafe { libc::poll(&mut pfd, 1, 1) };
    if res < 0 {
        tracing::warn!(
            pack_id,
            error = %std::io::Error::last_os_error(),
            "poll before abort failed"
        );
        return;
    }
    if res > 0 {
        // Response already waiting, too late to abort.
        return;
    }
    let mut h4 = SgIoV4 {
        guard: SG_GUARD_V4,
        request_extra: pack_id as u32,
        ..Default::default()
    };
    let res = unsafe { libc::ioctl(fd, SG_IOABORT as libc::c_ulong, &mut h4) };
    if res < 0 {
        tracing::warn!(
            pack_id,
            error = %std::io::Error::last_os_error(),
            "SG_IOABORT failed"
        );
    } else {
        tracing::debug!(pack_id, "sent SG_IOABORT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_category_round_trip() {
        for cat in [
            Category::Clean,
            Category::Recovered,
            Category::AbortedCommand,
            Category::UnitAttention,
            Category::MediumHard,
            Category::NotReady,
            Category::IllegalRequest,
            Category::Other,
        ] {
            assert_eq!(Outcome::from_category(cat).category(), cat);
        }
    }

    #[test]
    fn test_outcome_retryable() {
        assert!(Outcome::AbortedCommand.is_retryable());
        assert!(Outcome::UnitAttention.is_retryable());
        assert!(!Outcome::MediumHard.is_retryable());
        assert!(!Outcome::Clean.is_retryable());
        assert!(!Outcome::Other(Category::IllegalRequest).is_retryable());
    }

    #[test]
    fn test_outcome_clean() {
        assert!(Outcome::Clean.is_clean());
        assert!(Outcome::Recovered.is_clean());
        assert!(!Outcome::NotReady.is_clean());
    }

    #[test]
    fn test_scratch_starts_zeroed() {
        let s = CommandScratch::new();
        assert_eq!(s.cdb_len, 0);
        assert!(s.cdb.iter().all(|&b| b == 0));
        assert!(s.sense.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_submit_to_bad_fd_is_fatal_not_oom() {
        let mut scratch = CommandScratch::new();
        scratch.cdb_len = 10;
        let mut buf = [0u8; 512];
        let res = submit(
            -1,
            Iface::V3,
            Dir::FromDev,
            &mut scratch,
            buf.as_mut_ptr(),
            buf.len(),
            0,
            7,
        );
        assert!(matches!(res, Err(TransportError::Submit(_))));
    }

    #[test]
    fn test_receive_from_bad_fd() {
        let mut scratch = CommandScratch::new();
        let res = receive(-1, Iface::V4, Dir::FromDev, &mut scratch, 7, false);
        assert!(matches!(res, Err(TransportError::Receive(_))));
    }

    #[test]
    fn test_pack_id_mismatch_display() {
        let err = TransportError::PackIdMismatch {
            expected: 3,
            got: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("pack id 3"));
        assert!(msg.contains("got 4"));
    }
}
