//! Synchronous SCSI service commands issued over the blocking SG_IO ioctl.
//!
//! Capacity discovery (READ CAPACITY 10, escalating to 16 when the 32-bit
//! field saturates) and the post-copy SYNCHRONIZE CACHE. These run before
//! workers start or after they join, so the simple synchronous interface is
//! fine here.

use crate::error::Category;
use crate::scsi::sense;
use crate::sg::sys::{SgIoHdr, DEF_TIMEOUT_MS, SENSE_BUFF_LEN, SG_DXFER_FROM_DEV, SG_DXFER_NONE, SG_IO};
use nix::libc;
use std::os::unix::io::RawFd;
use thiserror::Error;

const READ_CAP10_CMD: u8 = 0x25;
const READ_CAP10_REPLY_LEN: usize = 8;
const SERVICE_ACTION_IN_16: u8 = 0x9e;
const SA_READ_CAP16: u8 = 0x10;
const READ_CAP16_REPLY_LEN: usize = 32;
const SYNC_CACHE10_CMD: u8 = 0x35;

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("SG_IO ioctl failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("command failed with category {0:?}")]
    Status(Category),
}

impl CmdError {
    /// Category to surface at process exit.
    pub fn category(&self) -> Category {
        match self {
            CmdError::Io(_) => Category::Other,
            CmdError::Status(cat) => *cat,
        }
    }

    /// True when the device reported UNIT ATTENTION; callers retry once.
    pub fn is_unit_attention(&self) -> bool {
        matches!(self, CmdError::Status(Category::UnitAttention))
    }
}

/// One blocking SG_IO round trip. `data` may be empty for commands with no
/// data-in phase.
fn sg_io(fd: RawFd, cdb: &mut [u8], data: &mut [u8]) -> Result<(), CmdError> {
    let mut sense = [0u8; SENSE_BUFF_LEN];
    let mut hdr = SgIoHdr {
        cmd_len: cdb.len() as u8,
        cmdp: cdb.as_mut_ptr(),
        dxfer_direction: if data.is_empty() {
            SG_DXFER_NONE
        } else {
            SG_DXFER_FROM_DEV
        },
        dxfer_len: data.len() as u32,
        dxferp: data.as_mut_ptr().cast(),
        mx_sb_len: SENSE_BUFF_LEN as u8,
        sbp: sense.as_mut_ptr(),
        timeout: DEF_TIMEOUT_MS,
        ..Default::default()
    };
    let res = unsafe { libc::ioctl(fd, SG_IO as libc::c_ulong, &mut hdr) };
    if res < 0 {
        return Err(CmdError::Io(std::io::Error::last_os_error()));
    }
    let sb = &sense[..hdr.sb_len_wr as usize];
    let cat = sense::categorize(hdr.status, hdr.host_status, hdr.driver_status, sb);
    if cat.is_clean() {
        Ok(())
    } else {
        Err(CmdError::Status(cat))
    }
}

/// READ CAPACITY on an sg device. Returns `(block_count, block_size)`.
/// Escalates from the 10-byte to the 16-byte form when the device reports
/// more than 2^32 - 1 blocks.
pub fn read_capacity(fd: RawFd) -> Result<(i64, u32), CmdError> {
    let mut cdb = [0u8; 10];
    cdb[0] = READ_CAP10_CMD;
    let mut reply = [0u8; READ_CAP10_REPLY_LEN];
    sg_io(fd, &mut cdb, &mut reply)?;

    let last_lba = u32::from_be_bytes(reply[0..4].try_into().unwrap());
    if last_lba == u32::MAX {
        return read_capacity_16(fd);
    }
    let sect_sz = u32::from_be_bytes(reply[4..8].try_into().unwrap());
    // take care not to sign extend values > 0x7fffffff
    Ok((i64::from(last_lba) + 1, sect_sz))
}

fn read_capacity_16(fd: RawFd) -> Result<(i64, u32), CmdError> {
    let mut cdb = [0u8; 16];
    cdb[0] = SERVICE_ACTION_IN_16;
    cdb[1] = SA_READ_CAP16;
    cdb[10..14].copy_from_slice(&(READ_CAP16_REPLY_LEN as u32).to_be_bytes());
    let mut reply = [0u8; READ_CAP16_REPLY_LEN];
    sg_io(fd, &mut cdb, &mut reply)?;

    let last_lba = u64::from_be_bytes(reply[0..8].try_into().unwrap());
    let sect_sz = u32::from_be_bytes(reply[8..12].try_into().unwrap());
    Ok((last_lba as i64 + 1, sect_sz))
}

/// SYNCHRONIZE CACHE(10) covering the whole device.
pub fn sync_cache(fd: RawFd) -> Result<(), CmdError> {
    let mut cdb = [0u8; 10];
    cdb[0] = SYNC_CACHE10_CMD;
    sg_io(fd, &mut cdb, &mut [])
}

/// Capacity of a block device via BLKSSZGET / BLKGETSIZE64.
/// Returns `(block_count, block_size)` where the count is in units of the
/// device's logical block size.
pub fn read_blkdev_capacity(fd: RawFd) -> Result<(i64, u32), std::io::Error> {
    let mut sect_sz: libc::c_int = 0;
    let res = unsafe { libc::ioctl(fd, libc::BLKSSZGET as libc::c_ulong, &mut sect_sz) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if sect_sz <= 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad logical block size from BLKSSZGET",
        ));
    }
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;
    let mut bytes: u64 = 0;
    let res = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut bytes) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(((bytes / sect_sz as u64) as i64, sect_sz as u32))
}
