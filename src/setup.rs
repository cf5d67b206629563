//! Turns validated operands into an opened, capacity-resolved
//! [`GlobalState`] ready for the worker fleet.
//!
//! Covers endpoint classification, the per-kind open paths, v3/v4 interface
//! promotion, capacity discovery when no count was given, and the automatic
//! CDB size promotion for large copies.

use crate::args::{Options, MAX_SCSI_CDBSZ};
use crate::copy::state::GlobalState;
use crate::error::SetupError;
use crate::filetype::{self, FileKind};
use crate::scsi::cmds;
use crate::sg::device::{self, PreparedFd, SgOpenOptions};
use nix::libc;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The opened copy: shared state plus the fd owners that keep it alive.
pub struct PreparedCopy {
    pub gs: Arc<GlobalState>,
    pub num_threads: usize,
    pub do_sync: bool,
    pub do_time: bool,
    pub ofile_given: bool,
    _owned: Vec<OwnedFd>,
    _sg_owned: Vec<PreparedFd>,
}

fn is_stdin_name(name: Option<&str>) -> bool {
    matches!(name, None | Some("-"))
}

fn open_plain(
    path: &Path,
    mut oflags: libc::c_int,
    direct: bool,
    excl: bool,
    dsync: bool,
    append: bool,
) -> Result<OwnedFd, SetupError> {
    if direct {
        oflags |= libc::O_DIRECT;
    }
    if excl {
        oflags |= libc::O_EXCL;
    }
    if dsync {
        oflags |= libc::O_SYNC;
    }
    if append {
        oflags |= libc::O_APPEND;
    }
    let cpath = std::ffi::CString::new(path.display().to_string()).map_err(|_| {
        SetupError::Open {
            path: path.display().to_string(),
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        }
    })?;
    let fd = unsafe { libc::open(cpath.as_ptr(), oflags, 0o666) };
    if fd < 0 {
        return Err(SetupError::Open {
            path: path.display().to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn seek_blocks(fd: RawFd, path: &Path, blk: i64, bs: usize) -> Result<(), SetupError> {
    let res = unsafe { libc::lseek(fd, blk * bs as i64, libc::SEEK_SET) };
    if res < 0 {
        return Err(SetupError::Seek {
            path: path.display().to_string(),
            blk,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn sg_opts(flags: &crate::copy::state::SideFlags, elem_sz: u32) -> SgOpenOptions {
    SgOpenOptions {
        direct: flags.direct,
        excl: flags.excl,
        dsync: flags.dsync,
        defres: flags.defres,
        mmap: false, /* worker opens carry the mmap, not the shared fds */
        elem_sz,
    }
}

/// Open everything and resolve the copy size. `opts` is consumed into the
/// shared state.
pub fn prepare(mut opts: Options) -> Result<PreparedCopy, SetupError> {
    let mut owned: Vec<OwnedFd> = Vec::new();
    let mut sg_owned: Vec<PreparedFd> = Vec::new();

    // Input endpoint.
    let mut in_fd: RawFd = libc::STDIN_FILENO;
    let mut in_kind = FileKind::Stdin;
    let mut in_path: Option<PathBuf> = None;
    if let Some(name) = opts.inf.clone().filter(|n| n.as_str() != "-") {
        let path = PathBuf::from(&name);
        in_kind = filetype::detect(&path);
        match in_kind {
            FileKind::Error => return Err(SetupError::Access(name)),
            FileKind::Tape => return Err(SetupError::TapeDevice(name)),
            FileKind::Sg => {
                let prep = device::open_prepared(
                    &path,
                    sg_opts(&opts.in_flags, opts.elem_sz),
                    opts.bs,
                    opts.bpt,
                )
                .map_err(|e| SetupError::SgPrepare {
                    path: name.clone(),
                    reason: e.to_string(),
                })?;
                in_fd = prep.raw();
                sg_owned.push(prep);
            }
            _ => {
                let fd = open_plain(
                    &path,
                    libc::O_RDONLY,
                    opts.in_flags.direct,
                    opts.in_flags.excl,
                    opts.in_flags.dsync,
                    false,
                )?;
                in_fd = std::os::fd::AsRawFd::as_raw_fd(&fd);
                owned.push(fd);
                if opts.skip > 0 {
                    seek_blocks(in_fd, &path, opts.skip, opts.bs)?;
                }
            }
        }
        in_path = Some(path);
    }
    if (opts.in_flags.v3 || opts.in_flags.v4) && in_kind != FileKind::Sg {
        warn!("iflag= v3 and v4 both ignored when IFILE is not an sg device");
        opts.in_flags.v3 = false;
        opts.in_flags.v4 = false;
    }

    // Output endpoint. `of` not given defaults to the null sink (differs
    // from classical dd); `-` is stdout.
    let ofile_given = opts.outf.is_some();
    let mut out_fd: RawFd = -1;
    let mut out_kind = FileKind::Null;
    let mut out_path: Option<PathBuf> = None;
    match opts.outf.clone() {
        Some(name) if name == "-" => {
            out_fd = libc::STDOUT_FILENO;
            out_kind = FileKind::Other;
        }
        Some(name) => {
            let path = PathBuf::from(&name);
            out_kind = filetype::detect(&path);
            match out_kind {
                FileKind::Tape => return Err(SetupError::TapeDevice(name)),
                FileKind::Sg => {
                    let prep = device::open_prepared(
                        &path,
                        sg_opts(&opts.out_flags, opts.elem_sz),
                        opts.bs,
                        opts.bpt,
                    )
                    .map_err(|e| SetupError::SgPrepare {
                        path: name.clone(),
                        reason: e.to_string(),
                    })?;
                    out_fd = prep.raw();
                    sg_owned.push(prep);
                }
                FileKind::Null => out_fd = -1, /* don't bother opening */
                FileKind::Raw => {
                    let fd = open_plain(&path, libc::O_WRONLY, false, false, false, false)?;
                    out_fd = std::os::fd::AsRawFd::as_raw_fd(&fd);
                    owned.push(fd);
                    if opts.seek > 0 {
                        seek_blocks(out_fd, &path, opts.seek, opts.bs)?;
                    }
                }
                _ => {
                    let fd = open_plain(
                        &path,
                        libc::O_WRONLY | libc::O_CREAT,
                        opts.out_flags.direct,
                        opts.out_flags.excl,
                        opts.out_flags.dsync,
                        opts.out_flags.append,
                    )?;
                    out_fd = std::os::fd::AsRawFd::as_raw_fd(&fd);
                    owned.push(fd);
                    if out_kind == FileKind::Error {
                        out_kind = FileKind::Other; /* regular file created */
                    }
                    if opts.seek > 0 {
                        seek_blocks(out_fd, &path, opts.seek, opts.bs)?;
                    }
                }
            }
            out_path = Some(path);
        }
        None => {}
    }
    if (opts.out_flags.v3 || opts.out_flags.v4) && out_kind != FileKind::Sg {
        warn!("oflag= v3 and v4 both ignored when OFILE is not an sg device");
        opts.out_flags.v3 = false;
        opts.out_flags.v4 = false;
    }

    // Second output; only an sg second output is ever written by workers,
    // but the file is opened (and created) like the primary.
    let mut out2_fd: Option<RawFd> = None;
    let mut out2_kind = FileKind::Null;
    let mut out2_path: Option<PathBuf> = None;
    if let Some(name) = opts.out2f.clone().filter(|n| n.as_str() != "-") {
        let path = PathBuf::from(&name);
        out2_kind = filetype::detect(&path);
        match out2_kind {
            FileKind::Tape => return Err(SetupError::TapeDevice(name)),
            FileKind::Sg => {
                let prep = device::open_prepared(
                    &path,
                    sg_opts(&opts.out_flags, opts.elem_sz),
                    opts.bs,
                    opts.bpt,
                )
                .map_err(|e| SetupError::SgPrepare {
                    path: name.clone(),
                    reason: e.to_string(),
                })?;
                out2_fd = Some(prep.raw());
                sg_owned.push(prep);
            }
            FileKind::Null => {}
            _ => {
                let fd = open_plain(
                    &path,
                    libc::O_WRONLY | libc::O_CREAT,
                    opts.out_flags.direct,
                    opts.out_flags.excl,
                    opts.out_flags.dsync,
                    opts.out_flags.append,
                )?;
                let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);
                owned.push(fd);
                if out2_kind == FileKind::Error {
                    out2_kind = FileKind::Other;
                }
                if opts.seek > 0 {
                    seek_blocks(raw, &path, opts.seek, opts.bs)?;
                }
                out2_fd = Some(raw);
            }
        }
        out2_path = Some(path);
    }

    // Promote the quieter side to v4 when both ends are sg and one asks for
    // it, unless the other was explicitly forced to v3.
    if in_kind == FileKind::Sg && out_kind == FileKind::Sg {
        if opts.in_flags.v4 && !opts.out_flags.v3 && !opts.out_flags.v4 {
            opts.out_flags.v4 = true;
            info!("changing OFILE from v3 to v4, use oflag=v3 to force v3");
        }
        if opts.out_flags.v4 && !opts.in_flags.v3 && !opts.in_flags.v4 {
            opts.in_flags.v4 = true;
            info!("changing IFILE from v3 to v4, use iflag=v3 to force v3");
        }
    }

    // Register file: regular file or pipe only.
    let mut outreg_fd: Option<RawFd> = None;
    if let Some(name) = opts.outregf.clone() {
        let path = PathBuf::from(&name);
        let kind = filetype::detect(&path);
        if !matches!(kind, FileKind::Other | FileKind::Error | FileKind::Null) {
            return Err(SetupError::Syntax(format!(
                "File: {name} can only be a regular file, pipe or /dev/null"
            )));
        }
        let fd = open_plain(&path, libc::O_WRONLY | libc::O_CREAT, false, false, false, false)?;
        let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);
        owned.push(fd);
        outreg_fd = Some(raw);
        debug!(path = %name, fd = raw, "register file opened");
    }

    if is_stdin_name(opts.inf.as_deref()) && !ofile_given {
        return Err(SetupError::Syntax(
            "Won't default both IFILE to stdin _and_ OFILE to /dev/null".into(),
        ));
    }

    // Resolve the copy size when none was given.
    let mut dd_count = opts.count;
    if dd_count < 0 {
        let in_span = discover_capacity(in_fd, in_kind, opts.bs, opts.skip, "input");
        let out_span = discover_capacity(out_fd, out_kind, opts.bs, opts.seek, "output");
        // A non-positive span on one side defers entirely to the other side.
        dd_count = match (in_span, out_span) {
            (Some(i), Some(o)) if i > 0 && o > 0 => i.min(o),
            (Some(i), _) if i > 0 => i,
            (_, Some(o)) => o,
            (_, None) => -1,
        };
        debug!(dd_count, "resolved copy size");
        if dd_count < 0 {
            return Err(SetupError::CountUnknown);
        }
    }

    // Promote to 16-byte CDBs when the span outgrows the 10/12-byte forms.
    let mut cdbsz_in = opts.cdbsz;
    let mut cdbsz_out = opts.cdbsz;
    if !opts.cdbsz_given {
        if in_kind == FileKind::Sg
            && cdbsz_in != MAX_SCSI_CDBSZ
            && (dd_count + opts.skip > u32::MAX as i64 || opts.bpt > u16::MAX as usize)
        {
            info!("SCSI command size increased to 16 bytes (for 'if')");
            cdbsz_in = MAX_SCSI_CDBSZ;
        }
        if out_kind == FileKind::Sg
            && cdbsz_out != MAX_SCSI_CDBSZ
            && (dd_count + opts.seek > u32::MAX as i64 || opts.bpt > u16::MAX as usize)
        {
            info!("SCSI command size increased to 16 bytes (for 'of')");
            cdbsz_out = MAX_SCSI_CDBSZ;
        }
    }

    let mut gs = GlobalState::new(opts.bs, opts.bpt, dd_count, opts.skip, opts.seek);
    gs.aen = opts.aen;
    gs.elem_sz = opts.elem_sz;
    gs.cdbsz_in = cdbsz_in;
    gs.cdbsz_out = cdbsz_out;
    gs.debug = opts.debug;
    gs.in_fd = in_fd;
    gs.in_kind = in_kind;
    gs.in_flags = opts.in_flags;
    gs.in_path = in_path;
    gs.out_fd = out_fd;
    gs.out_kind = out_kind;
    gs.out_flags = opts.out_flags;
    gs.out_path = out_path;
    gs.out2_fd = out2_fd;
    gs.out2_kind = out2_kind;
    gs.out2_path = out2_path;
    gs.outreg_fd = outreg_fd;

    Ok(PreparedCopy {
        gs: Arc::new(gs),
        num_threads: opts.num_threads,
        do_sync: opts.do_sync,
        do_time: opts.do_time,
        ofile_given,
        _owned: owned,
        _sg_owned: sg_owned,
    })
}

/// Usable block span of one endpoint after its start offset, or `None` when
/// the capacity cannot be determined.
fn discover_capacity(
    fd: RawFd,
    kind: FileKind,
    bs: usize,
    start: i64,
    which: &str,
) -> Option<i64> {
    let (num_sect, sect_sz) = match kind {
        FileKind::Sg => {
            let res = match cmds::read_capacity(fd) {
                Err(e) if e.is_unit_attention() => {
                    warn!(which, "unit attention, media changed, continuing");
                    cmds::read_capacity(fd)
                }
                other => other,
            };
            match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(which, error = %e, "unable to read capacity");
                    return None;
                }
            }
        }
        FileKind::BlockDev => match cmds::read_blkdev_capacity(fd) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(which, error = %e, "unable to read block device capacity");
                return None;
            }
        },
        _ => return None,
    };
    if kind == FileKind::BlockDev && sect_sz as usize != bs {
        warn!(
            which,
            bs,
            device_bs = sect_sz,
            "logical block size confusion, ignoring device capacity"
        );
        return None;
    }
    if num_sect > start {
        Some(num_sect - start)
    } else {
        Some(num_sect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    fn opts(ops: &[&str]) -> Options {
        let v: Vec<String> = ops.iter().map(|s| s.to_string()).collect();
        args::parse_operands(&v).unwrap()
    }

    #[test]
    fn test_regular_file_copy_setup() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, vec![7u8; 4 * 512]).unwrap();
        let prepared = prepare(opts(&[
            &format!("if={}", src.display()),
            &format!("of={}", dst.display()),
            "count=4",
        ]))
        .unwrap();
        assert_eq!(prepared.gs.total, 4);
        assert_eq!(prepared.gs.in_kind, FileKind::Other);
        assert_eq!(prepared.gs.out_kind, FileKind::Other);
        assert!(prepared.ofile_given);
        assert!(dst.exists());
    }

    #[test]
    fn test_missing_input_rejected() {
        let res = prepare(opts(&["if=/no/such/input", "of=.", "count=1"]));
        assert!(matches!(res, Err(SetupError::Access(_))));
    }

    #[test]
    fn test_stdin_with_defaulted_output_rejected() {
        let res = prepare(opts(&["count=1"]));
        assert!(matches!(res, Err(SetupError::Syntax(_))));
        let res = prepare(opts(&["if=-", "count=1"]));
        assert!(matches!(res, Err(SetupError::Syntax(_))));
    }

    #[test]
    fn test_null_output_not_opened() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, vec![0u8; 512]).unwrap();
        let prepared =
            prepare(opts(&[&format!("if={}", src.display()), "of=.", "count=1"])).unwrap();
        assert_eq!(prepared.gs.out_kind, FileKind::Null);
        assert_eq!(prepared.gs.out_fd, -1);
    }

    #[test]
    fn test_stdout_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, vec![0u8; 512]).unwrap();
        let prepared =
            prepare(opts(&[&format!("if={}", src.display()), "of=-", "count=1"])).unwrap();
        assert_eq!(prepared.gs.out_fd, libc::STDOUT_FILENO);
        assert_eq!(prepared.gs.out_kind, FileKind::Other);
    }

    #[test]
    fn test_count_from_file_requires_operand() {
        // Regular files have no discoverable capacity here, so a missing
        // count is an error.
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, vec![0u8; 512]).unwrap();
        let res = prepare(opts(&[
            &format!("if={}", src.display()),
            &format!("of={}", dst.display()),
        ]));
        assert!(matches!(res, Err(SetupError::CountUnknown)));
    }

    #[test]
    fn test_skip_positions_input_fd() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, vec![1u8; 8 * 512]).unwrap();
        let prepared = prepare(opts(&[
            &format!("if={}", src.display()),
            &format!("of={}", dst.display()),
            "count=2",
            "skip=3",
        ]))
        .unwrap();
        let pos = unsafe { libc::lseek(prepared.gs.in_fd, 0, libc::SEEK_CUR) };
        assert_eq!(pos, 3 * 512);
    }

    #[test]
    fn test_outreg_must_be_regular() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, vec![0u8; 512]).unwrap();
        // a directory is not an acceptable register target
        let res = prepare(opts(&[
            &format!("if={}", src.display()),
            "of=.",
            "count=1",
            &format!("ofreg={}", dir.path().display()),
        ]));
        assert!(res.is_err());
    }
}
