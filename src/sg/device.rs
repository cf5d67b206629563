//! Opening and preparing sg file descriptors.
//!
//! Each sg fd used by the copy engine is probed for a v4-capable driver,
//! given a scatter-gather element size hint when requested, sized with a
//! reserved buffer of `bs * bpt` bytes (unless `defres`), optionally mmap'd
//! so the user buffer aliases the reserved buffer, and switched to
//! force-pack-id mode so completions can be matched by id.

use crate::sg::sys::*;
use nix::libc;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::null_mut;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("could not open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("sg driver on {path} is prior to 4.0.00 (version {version})")]
    DriverTooOld { path: String, version: i32 },

    #[error("ioctl {name} failed on {path}: {source}")]
    Ioctl {
        name: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("mmap of reserved buffer failed: {0}")]
    Mmap(std::io::Error),
}

/// A memory-mapped region with unmap-on-drop. Used both for mapping an sg
/// fd's reserved buffer and for page-aligned anonymous worker buffers.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: *mut u8,
    len: usize,
}

// The region is plain bytes owned by exactly one worker.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// Map `len` bytes of `fd`'s reserved buffer.
    pub fn map_fd(fd: RawFd, len: usize) -> Result<Self, DeviceError> {
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DeviceError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Page-aligned anonymous mapping; the ordinary worker data buffer.
    pub fn anonymous(len: usize) -> Result<Self, DeviceError> {
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DeviceError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the whole region as a mutable byte slice.
    ///
    /// # Safety
    /// The caller must be the only user of the region for the lifetime of
    /// the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_slice_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.ptr.cast(), self.len) };
        if res < 0 {
            warn!(error = %std::io::Error::last_os_error(), "munmap failed");
        }
    }
}

/// Open-time knobs for one sg fd.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgOpenOptions {
    pub direct: bool,
    pub excl: bool,
    pub dsync: bool,
    /// Keep the driver's default reserved-buffer size.
    pub defres: bool,
    /// Map the reserved buffer and use it as the data buffer.
    pub mmap: bool,
    /// Scatter-gather element size hint in bytes; 0 leaves the driver value.
    pub elem_sz: u32,
}

/// An opened and prepared sg fd, plus the reserved-buffer mapping when mmap
/// IO was requested.
#[derive(Debug)]
pub struct PreparedFd {
    pub fd: OwnedFd,
    pub resv_len: usize,
    pub mmap: Option<MmapRegion>,
}

impl PreparedFd {
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Open an sg device and prepare it for the copy engine. `bs * bpt` sizes
/// the reserved buffer.
pub fn open_prepared(
    path: &Path,
    opts: SgOpenOptions,
    bs: usize,
    bpt: usize,
) -> Result<PreparedFd, DeviceError> {
    let mut oflags = libc::O_RDWR;
    if opts.direct {
        oflags |= libc::O_DIRECT;
    }
    if opts.excl {
        oflags |= libc::O_EXCL;
    }
    if opts.dsync {
        oflags |= libc::O_SYNC;
    }
    let path_str = path.display().to_string();
    let cpath = std::ffi::CString::new(path_str.clone()).map_err(|_| DeviceError::Open {
        path: path_str.clone(),
        source: std::io::Error::from_raw_os_error(libc::EINVAL),
    })?;
    let fd = unsafe { libc::open(cpath.as_ptr(), oflags) };
    if fd < 0 {
        return Err(DeviceError::Open {
            path: path_str,
            source: std::io::Error::last_os_error(),
        });
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let version = driver_version(fd.as_raw_fd()).map_err(|source| DeviceError::Ioctl {
        name: "SG_GET_VERSION_NUM",
        path: path_str.clone(),
        source,
    })?;
    if version < MIN_V4_DRIVER_VERSION {
        return Err(DeviceError::DriverTooOld {
            path: path_str,
            version,
        });
    }

    if opts.elem_sz >= 4096 {
        set_elem_size(fd.as_raw_fd(), opts.elem_sz, &path_str);
    }

    let mut resv_len = 0usize;
    let mut mmap = None;
    if !opts.defres {
        resv_len = bs * bpt;
        let mut num = resv_len as libc::c_int;
        let res = unsafe {
            libc::ioctl(fd.as_raw_fd(), SG_SET_RESERVED_SIZE as libc::c_ulong, &mut num)
        };
        if res < 0 {
            return Err(DeviceError::Ioctl {
                name: "SG_SET_RESERVED_SIZE",
                path: path_str,
                source: std::io::Error::last_os_error(),
            });
        }
        if opts.mmap {
            mmap = Some(MmapRegion::map_fd(fd.as_raw_fd(), resv_len)?);
        }
    }

    let mut one: libc::c_int = 1;
    let res = unsafe {
        libc::ioctl(fd.as_raw_fd(), SG_SET_FORCE_PACK_ID as libc::c_ulong, &mut one)
    };
    if res < 0 {
        return Err(DeviceError::Ioctl {
            name: "SG_SET_FORCE_PACK_ID",
            path: path_str,
            source: std::io::Error::last_os_error(),
        });
    }
    debug!(path = %path.display(), version, resv_len, mmap = opts.mmap, "prepared sg fd");
    Ok(PreparedFd { fd, resv_len, mmap })
}

/// Probe the sg driver version number (e.g. 40045 for 4.0.45).
pub fn driver_version(fd: RawFd) -> Result<i32, std::io::Error> {
    let mut version: libc::c_int = 0;
    let res = unsafe { libc::ioctl(fd, SG_GET_VERSION_NUM as libc::c_ulong, &mut version) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(version)
}

/// Apply the scatter-gather element size hint; failures are logged and
/// ignored, matching driver behaviour for unsupported sizes.
fn set_elem_size(fd: RawFd, elem_sz: u32, path: &str) {
    let mut sei = SgExtendedInfo {
        sei_rd_mask: SG_SEIM_SGAT_ELEM_SZ,
        ..Default::default()
    };
    let res = unsafe { libc::ioctl(fd, SG_SET_GET_EXTENDED as libc::c_ulong, &mut sei) };
    if res < 0 {
        warn!(path, error = %std::io::Error::last_os_error(),
              "SG_SET_GET_EXTENDED(SGAT_ELEM_SZ) read failed");
        return;
    }
    if sei.sgat_elem_sz != elem_sz {
        let mut sei = SgExtendedInfo {
            sei_wr_mask: SG_SEIM_SGAT_ELEM_SZ,
            sgat_elem_sz: elem_sz,
            ..Default::default()
        };
        let res = unsafe { libc::ioctl(fd, SG_SET_GET_EXTENDED as libc::c_ulong, &mut sei) };
        if res < 0 {
            warn!(path, elem_sz, error = %std::io::Error::last_os_error(),
                  "SG_SET_GET_EXTENDED(SGAT_ELEM_SZ) write failed");
        }
    }
}
