//! File kind detection by device-number inspection.
//!
//! The copy engine picks its I/O backend per side from the kind: sg char
//! devices get the SCSI command path, block/raw/regular files get ordinary
//! read/write, the null kind skips output entirely. SCSI tape devices are
//! recognised only to be rejected.

use nix::libc;
use nix::sys::stat;
use std::path::Path;

const SCSI_GENERIC_MAJOR: u64 = 21;
const SCSI_TAPE_MAJOR: u64 = 9;
const RAW_MAJOR: u64 = 162;
const MEM_MAJOR: u64 = 1;
const DEV_NULL_MINOR: u64 = 3;

/// What a copy endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// SCSI generic char device.
    Sg,
    /// Block device.
    BlockDev,
    /// Raw char device bound to a block device.
    Raw,
    /// `/dev/null` or the `.` alias; output side only performs accounting.
    Null,
    /// SCSI tape char device; rejected at setup.
    Tape,
    /// Standard input (`-` or no `if=`).
    Stdin,
    /// Regular file, pipe, tty, anything else.
    Other,
    /// Could not stat; output files may still be created.
    Error,
}

impl FileKind {
    /// Kinds with a meaningful byte offset: a worker repositions before each
    /// ordinary read.
    #[inline]
    pub fn is_seekable(self) -> bool {
        matches!(self, FileKind::Other | FileKind::BlockDev | FileKind::Raw)
    }
}

/// Classify `path`. `.` is the null sink without touching the filesystem.
pub fn detect(path: &Path) -> FileKind {
    if path.as_os_str() == "." {
        return FileKind::Null;
    }
    let st = match stat::stat(path) {
        Ok(st) => st,
        Err(_) => return FileKind::Error,
    };
    let mode = st.st_mode;
    if mode & libc::S_IFMT == libc::S_IFCHR {
        let major = stat::major(st.st_rdev);
        let minor = stat::minor(st.st_rdev);
        if major == MEM_MAJOR && minor == DEV_NULL_MINOR {
            return FileKind::Null;
        }
        if major == RAW_MAJOR {
            return FileKind::Raw;
        }
        if major == SCSI_GENERIC_MAJOR {
            return FileKind::Sg;
        }
        if major == SCSI_TAPE_MAJOR {
            return FileKind::Tape;
        }
        return FileKind::Other;
    }
    if mode & libc::S_IFMT == libc::S_IFBLK {
        return FileKind::BlockDev;
    }
    FileKind::Other
}
