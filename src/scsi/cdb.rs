//! SCSI READ/WRITE command descriptor block construction.
//!
//! Builds the fixed-length CDB formats from SBC: 6, 10, 12 and 16 byte
//! variants, selected by `cdbsz`. The 6-byte form carries a 21-bit LBA and a
//! one-byte count (256 encoded as 0) and has no room for the DPO/FUA bits.

use thiserror::Error;

/// READ opcodes indexed by size class {6, 10, 12, 16}.
const RD_OPCODE: [u8; 4] = [0x08, 0x28, 0xa8, 0x88];
/// WRITE opcodes indexed by size class {6, 10, 12, 16}.
const WR_OPCODE: [u8; 4] = [0x0a, 0x2a, 0xaa, 0x8a];

/// Largest CDB this tool issues.
pub const MAX_CDB_SZ: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CdbError {
    #[error("for 6 byte commands, maximum number of blocks is 256")]
    SixByteCount,

    #[error("for 6 byte commands, can't address blocks beyond 0x1fffff")]
    SixByteLba,

    #[error("for 6 byte commands, neither dpo nor fua bits supported")]
    SixByteDpoFua,

    #[error("for 10 byte commands, maximum number of blocks is 0xffff")]
    TenByteCount,

    #[error("expected cdb size of 6, 10, 12, or 16 but got {0}")]
    BadSize(usize),
}

/// Build a READ or WRITE CDB into `cdb`, returning the number of bytes used.
///
/// `cdb` must be at least `cdbsz` long; the used prefix is fully overwritten.
pub fn build_rw_cdb(
    cdb: &mut [u8; MAX_CDB_SZ],
    cdbsz: usize,
    blocks: u32,
    start_lba: i64,
    write_true: bool,
    fua: bool,
    dpo: bool,
) -> Result<usize, CdbError> {
    cdb.fill(0);
    let mut ctl_byte = 0u8;
    if dpo {
        ctl_byte |= 0x10;
    }
    if fua {
        ctl_byte |= 0x8;
    }
    match cdbsz {
        6 => {
            if blocks > 256 {
                return Err(CdbError::SixByteCount);
            }
            if (start_lba + i64::from(blocks) - 1) & !0x1f_ffff != 0 {
                return Err(CdbError::SixByteLba);
            }
            if dpo || fua {
                return Err(CdbError::SixByteDpoFua);
            }
            cdb[0] = if write_true { WR_OPCODE[0] } else { RD_OPCODE[0] };
            let lba = (start_lba as u32) & 0x1f_ffff;
            cdb[1] = (lba >> 16) as u8;
            cdb[2] = (lba >> 8) as u8;
            cdb[3] = lba as u8;
            cdb[4] = if blocks == 256 { 0 } else { blocks as u8 };
        }
        10 => {
            if blocks & !0xffff != 0 {
                return Err(CdbError::TenByteCount);
            }
            cdb[0] = if write_true { WR_OPCODE[1] } else { RD_OPCODE[1] };
            cdb[1] = ctl_byte;
            cdb[2..6].copy_from_slice(&(start_lba as u32).to_be_bytes());
            cdb[7..9].copy_from_slice(&(blocks as u16).to_be_bytes());
        }
        12 => {
            cdb[0] = if write_true { WR_OPCODE[2] } else { RD_OPCODE[2] };
            cdb[1] = ctl_byte;
            cdb[2..6].copy_from_slice(&(start_lba as u32).to_be_bytes());
            cdb[6..10].copy_from_slice(&blocks.to_be_bytes());
        }
        16 => {
            cdb[0] = if write_true { WR_OPCODE[3] } else { RD_OPCODE[3] };
            cdb[1] = ctl_byte;
            cdb[2..10].copy_from_slice(&(start_lba as u64).to_be_bytes());
            cdb[10..14].copy_from_slice(&blocks.to_be_bytes());
        }
        other => return Err(CdbError::BadSize(other)),
    }
    Ok(cdbsz)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(
        cdbsz: usize,
        blocks: u32,
        lba: i64,
        wr: bool,
        fua: bool,
        dpo: bool,
    ) -> Result<[u8; MAX_CDB_SZ], CdbError> {
        let mut cdb = [0xaau8; MAX_CDB_SZ];
        build_rw_cdb(&mut cdb, cdbsz, blocks, lba, wr, fua, dpo)?;
        Ok(cdb)
    }

    #[test]
    fn test_read10_layout() {
        let cdb = build(10, 0x1234, 0x0102_0304, false, false, false).unwrap();
        assert_eq!(cdb[0], 0x28);
        assert_eq!(cdb[1], 0);
        assert_eq!(&cdb[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(cdb[6], 0);
        assert_eq!(&cdb[7..9], &[0x12, 0x34]);
        assert_eq!(cdb[9], 0);
    }

    #[test]
    fn test_write10_opcode() {
        let cdb = build(10, 1, 0, true, false, false).unwrap();
        assert_eq!(cdb[0], 0x2a);
    }

    #[test]
    fn test_fua_dpo_bits() {
        let cdb = build(10, 1, 0, true, true, false).unwrap();
        assert_eq!(cdb[1], 0x8);
        let cdb = build(10, 1, 0, true, false, true).unwrap();
        assert_eq!(cdb[1], 0x10);
        let cdb = build(16, 1, 0, false, true, true).unwrap();
        assert_eq!(cdb[1], 0x18);
    }

    #[test]
    fn test_read6_layout() {
        let cdb = build(6, 255, 0x15_4321, false, false, false).unwrap();
        assert_eq!(cdb[0], 0x08);
        assert_eq!(&cdb[1..4], &[0x15, 0x43, 0x21]);
        assert_eq!(cdb[4], 255);
        assert_eq!(cdb[5], 0);
    }

    #[test]
    fn test_six_byte_256_encoded_as_zero() {
        let cdb = build(6, 256, 0, true, false, false).unwrap();
        assert_eq!(cdb[0], 0x0a);
        assert_eq!(cdb[4], 0);
    }

    #[test]
    fn test_six_byte_count_overflow() {
        assert_eq!(
            build(6, 257, 0, false, false, false),
            Err(CdbError::SixByteCount)
        );
    }

    #[test]
    fn test_six_byte_lba_overflow() {
        // start + blocks - 1 crosses the 21-bit boundary
        assert_eq!(
            build(6, 2, 0x1f_ffff, false, false, false),
            Err(CdbError::SixByteLba)
        );
        // exactly the last addressable block is fine
        assert!(build(6, 1, 0x1f_ffff, false, false, false).is_ok());
    }

    #[test]
    fn test_six_byte_rejects_fua_dpo() {
        assert_eq!(
            build(6, 1, 0, false, true, false),
            Err(CdbError::SixByteDpoFua)
        );
        assert_eq!(
            build(6, 1, 0, false, false, true),
            Err(CdbError::SixByteDpoFua)
        );
    }

    #[test]
    fn test_ten_byte_count_overflow() {
        assert_eq!(
            build(10, 0x1_0000, 0, false, false, false),
            Err(CdbError::TenByteCount)
        );
        assert!(build(10, 0xffff, 0, false, false, false).is_ok());
    }

    #[test]
    fn test_read12_layout() {
        let cdb = build(12, 0x0011_2233, 0x0a0b_0c0d, false, false, false).unwrap();
        assert_eq!(cdb[0], 0xa8);
        assert_eq!(&cdb[2..6], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&cdb[6..10], &[0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_read16_layout() {
        let lba = 0x0102_0304_0506_0708i64;
        let cdb = build(16, 0x7788_99aa, lba, false, false, false).unwrap();
        assert_eq!(cdb[0], 0x88);
        assert_eq!(
            &cdb[2..10],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert_eq!(&cdb[10..14], &[0x77, 0x88, 0x99, 0xaa]);
        assert_eq!(cdb[14], 0);
        assert_eq!(cdb[15], 0);
    }

    #[test]
    fn test_write16_opcode() {
        let cdb = build(16, 1, 0, true, false, false).unwrap();
        assert_eq!(cdb[0], 0x8a);
    }

    #[test]
    fn test_bad_size() {
        assert_eq!(build(8, 1, 0, false, false, false), Err(CdbError::BadSize(8)));
    }

    #[test]
    fn test_tail_zero_padded() {
        // scratch prefilled with garbage must come out zeroed past the opcode
        let cdb = build(10, 0, 0, false, false, false).unwrap();
        assert!(cdb[1..10].iter().all(|&b| b == 0));
        assert!(cdb[10..].iter().all(|&b| b == 0));
    }
}
