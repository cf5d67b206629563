//! sgdd - copy files/devices with multiple threads, specialised for Linux
//! SCSI generic (sg) devices.

use anyhow::Context;
use clap::{ArgAction, Parser};
use sgdd::args::{self, Options};
use sgdd::copy::runner;
use sgdd::error::{Category, SetupError};
use sgdd::signals;
use sgdd::stats;
use sgdd::{setup, setup::PreparedCopy};
use std::process::ExitCode;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// dd-style copy for SCSI generic devices
#[derive(Parser)]
#[command(name = "sgdd")]
#[command(version, disable_help_flag = true)]
#[command(about = "Copy IFILE to OFILE with multiple threads, specialised for sg devices")]
struct Cli {
    /// Prepare both ends but bypass the copy
    #[arg(short = 'd', long = "dry-run", action = ArgAction::Count)]
    dry_run: u8,

    /// Print usage; repeat for the less used operands and the flag list
    #[arg(short = 'h', long = "help", action = ArgAction::Count)]
    help: u8,

    /// Increase verbosity
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// dd-style name=value operands
    #[arg(value_name = "OPERAND")]
    operands: Vec<String>,
}

fn init_tracing(debug: u8) {
    let default = match debug {
        0 => "warn",
        1 => "info",
        2 | 3 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sgdd: {e:#}");
            let cat = e
                .downcast_ref::<SetupError>()
                .map(SetupError::category)
                .unwrap_or(Category::Other);
            if cat == Category::SyntaxError {
                eprintln!("For more information use '--help'");
            }
            ExitCode::from(cat.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if cli.help > 0 {
        usage(cli.help);
        return Ok(ExitCode::SUCCESS);
    }

    let mut opts: Options = args::parse_operands(&cli.operands)?;
    opts.debug = opts.debug.saturating_add(cli.verbose);
    init_tracing(opts.debug);
    let dry_run = cli.dry_run > 0;

    let prepared: PreparedCopy = setup::prepare(opts)?;
    let gs = prepared.gs.clone();
    if gs.debug > 0 {
        eprintln!(
            "sgdd: if={} skip={} of={} seek={} count={}",
            gs.in_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into()),
            gs.skip,
            gs.out_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| ".".into()),
            gs.seek,
            gs.total,
        );
    }

    if dry_run {
        eprintln!("Due to --dry-run option, bypass copy/read");
        stats::print_stats("", &gs);
        return Ok(ExitCode::SUCCESS);
    }
    if !prepared.ofile_given {
        eprintln!("of=OFILE not given so only read from IFILE, to output to stdout use 'of=-'");
    }

    let set = signals::block_signals().context("could not block signals")?;
    let start = Instant::now();
    let listener = signals::spawn_listener(set, gs.clone(), start, prepared.do_time);

    runner::run_copy(&gs, prepared.num_threads);

    if prepared.do_time {
        stats::print_throughput(&gs, start, false);
    }
    if prepared.do_sync {
        runner::sync_caches(&gs);
    }
    listener.shutdown();

    let mut res = gs.exit_status();
    let out_count = gs.out_side.lock().unwrap().count;
    if out_count != 0 {
        eprintln!(">>>> Some error occurred, remaining blocks={out_count}");
        if res == Category::Clean {
            res = Category::Other;
        }
    }
    stats::print_stats("", &gs);

    let snap = stats::Snapshot::take(&gs);
    if snap.dio_incomplete > 0 {
        eprintln!(
            ">> Direct IO requested but incomplete {} times",
            snap.dio_incomplete
        );
        if let Ok(contents) = std::fs::read_to_string("/proc/scsi/sg/allow_dio") {
            if contents.trim_start().starts_with('0') {
                eprintln!(
                    ">>> /proc/scsi/sg/allow_dio set to '0' but should be set to '1' for direct IO"
                );
            }
        }
    }
    if snap.resid_sum != 0 {
        eprintln!(">> Non-zero sum of residual counts={}", snap.resid_sum);
    }
    Ok(ExitCode::from(res.exit_code() as u8))
}

fn usage(page: u8) {
    match page {
        1 => {
            eprintln!(
                "Usage: sgdd  [bs=BS] [count=COUNT] [ibs=BS] [if=IFILE] [iflag=FLAGS]\n\
                 \x20            [obs=BS] [of=OFILE] [oflag=FLAGS] [seek=SEEK] [skip=SKIP]\n\
                 \x20            [--help] [--version]\n\n\
                 \x20            [ae=AEN] [bpt=BPT] [cdbsz=6|10|12|16] [coe=0|1] [deb=VERB]\n\
                 \x20            [dio=0|1] [elemsz_kb=ESK] [fua=0|1|2|3] [of2=OFILE2]\n\
                 \x20            [ofreg=OFREG] [sync=0|1] [thr=THR] [time=0|1] [verbose=VERB]\n\
                 \x20            [--dry-run] [--verbose]\n\n\
                 \x20 where the main options are:\n\
                 \x20   bs          must be device logical block size (default 512)\n\
                 \x20   count       number of blocks to copy (def: device size)\n\
                 \x20   if          file or device to read from (def: stdin)\n\
                 \x20   iflag       comma separated list from: [coe,defres,dio,direct,dpo,\n\
                 \x20               dsync,excl,fua,mmap,noshare,noxfer,null,same_fds,v3,v4]\n\
                 \x20   of          file or device to write to (def: /dev/null, N.B. different\n\
                 \x20               from dd it defaults to stdout). If 'of=.' uses /dev/null\n\
                 \x20   of2         second file or device to write to (def: /dev/null)\n\
                 \x20   oflag       comma separated list from: [append,coe,dio,direct,dpo,\n\
                 \x20               dsync,excl,fua,mmap,noshare,noxfer,null,same_fds,swait,v3,v4]\n\
                 \x20   seek        block position to start writing to OFILE\n\
                 \x20   skip        block position to start reading from IFILE\n\
                 \x20   --help|-h      output this usage message then exit\n\
                 \x20   --version|-V   output version string then exit\n\n\
                 Copy IFILE to OFILE, similar to the dd command, specialised for SCSI\n\
                 devices and using multiple threads. It expects one or both of IFILE and\n\
                 OFILE to be sg devices. It is Linux specific and uses the v4 sg driver\n\
                 'share' capability if available. Use '-hh' or '-hhh' for more information.\n\n\
                 In this version oflag=swait does read completion _after_ write completion"
            );
        }
        2 => {
            eprintln!(
                "Syntax:  sgdd [operands] [options]\n\n\
                 \x20 where operands have the form name=value and are peculiar to 'dd'\n\
                 \x20 style commands, and options start with one or two hyphens\n\n\
                 \x20 where the less used options are:\n\
                 \x20   ae          abort every n commands (def: 0 --> don't abort any)\n\
                 \x20   bpt         is blocks_per_transfer (default is 128)\n\
                 \x20   cdbsz       size of SCSI READ or WRITE cdb (default is 10)\n\
                 \x20   coe         continue on error, 0->exit (def), 1->zero + continue\n\
                 \x20   deb         for debug, 0->none (def), > 0->varying degrees of debug\n\
                 \x20   dio         is direct IO, 1->attempt, 0->indirect IO (def)\n\
                 \x20   elemsz_kb   scatter gather list element size in kilobytes (def: 32[KB])\n\
                 \x20   fua         force unit access: 0->don't(def), 1->OFILE, 2->IFILE,\n\
                 \x20               3->OFILE+IFILE\n\
                 \x20   ofreg       OFREG is regular file or pipe to send what is read from\n\
                 \x20               IFILE in the first half of each shared element\n\
                 \x20   sync        0->no sync(def), 1->SYNCHRONIZE CACHE on OFILE after copy\n\
                 \x20   thr         is number of threads, must be > 0, default 4, max 16\n\
                 \x20   time        0->no timing, 1->time plus calculate throughput (def)\n\
                 \x20   verbose     same as 'deb=VERB': increase verbosity\n\
                 \x20   --dry-run|-d    prepare but bypass copy/read\n\
                 \x20   --verbose|-v    increase verbosity of utility\n\n\
                 Use '-hhh' for more information about flags."
            );
        }
        _ => {
            eprintln!(
                "Syntax:  sgdd [operands] [options]\n\n\
                 \x20 where 'iflag=' and 'oflag=' arguments are listed below:\n\
                 \x20   append      append output to OFILE (assumes OFILE is regular file)\n\
                 \x20   coe         continue on error (reading, fills with zeros)\n\
                 \x20   defres      keep default reserve buffer size (else its bs*bpt)\n\
                 \x20   dio         sets the SG_FLAG_DIRECT_IO in sg requests\n\
                 \x20   direct      sets the O_DIRECT flag on open()\n\
                 \x20   dpo         sets the DPO (disable page out) in SCSI READs and WRITEs\n\
                 \x20   dsync       sets the O_SYNC flag on open()\n\
                 \x20   excl        sets the O_EXCL flag on open()\n\
                 \x20   fua         sets the FUA (force unit access) in SCSI READs and WRITEs\n\
                 \x20   mmap        setup mmap IO on IFILE or OFILE; OFILE only with noshare\n\
                 \x20   noshare     if IFILE and OFILE are sg devices, don't set up sharing\n\
                 \x20               (def: do)\n\
                 \x20   same_fds    each thread uses the same IFILE and OFILE(2) file\n\
                 \x20               descriptors (def: each thread has own file descriptors)\n\
                 \x20   swait       slave wait: issue WRITE on OFILE before READ is finished;\n\
                 \x20               [oflag only] and IFILE and OFILE must be sg devices\n\
                 \x20   v3          use v3 sg interface which is the default (also see v4)\n\
                 \x20   v4          use v4 sg interface (def: v3 unless other side is v4)\n\n\
                 Copies IFILE to OFILE (and to OFILE2 if given). If IFILE and OFILE are sg\n\
                 devices 'shared' mode is selected unless 'noshare' is given to 'iflag=' or\n\
                 'oflag='. of2=OFILE2 uses 'oflag=FLAGS'. When sharing, the data stays in a\n\
                 single in-kernel buffer which is copied (or mmap-ed) to the user space\n\
                 if the 'ofreg=OFREG' is given."
            );
        }
    }
}
