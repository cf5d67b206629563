//! End-to-end copies over regular files, driving the real setup and worker
//! fleet without any sg device present.

use sgdd::args;
use sgdd::copy::runner;
use sgdd::error::Category;
use sgdd::setup;

fn run(ops: &[String]) -> (setup::PreparedCopy, Category) {
    let opts = args::parse_operands(ops).expect("operands parse");
    let prepared = setup::prepare(opts).expect("setup");
    runner::run_copy(&prepared.gs, prepared.num_threads);
    let status = prepared.gs.exit_status();
    (prepared, status)
}

fn ops(list: &[String]) -> Vec<String> {
    list.to_vec()
}

#[test]
fn copy_zero_source_through_two_workers() {
    // bs=512 count=8 bpt=4 thr=2 if=/dev/zero: destination receives 4096
    // zero bytes.
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("out");
    let (prepared, status) = run(&ops(&[
        "bs=512".into(),
        "count=8".into(),
        "bpt=4".into(),
        "thr=2".into(),
        "if=/dev/zero".into(),
        format!("of={}", dst.display()),
    ]));
    assert_eq!(status, Category::Clean);
    let got = std::fs::read(&dst).unwrap();
    assert_eq!(got.len(), 4096);
    assert!(got.iter().all(|&b| b == 0));
    assert_eq!(prepared.gs.out_side.lock().unwrap().rem, 0);
}

#[test]
fn copy_is_bit_identical_with_short_final_segment() {
    // bs=512 count=10 bpt=3 thr=3 over a 5120-byte ascending source: the
    // final segment is one block and the output matches byte for byte.
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..10 * 512).map(|i| (i % 256) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let (prepared, status) = run(&ops(&[
        "bs=512".into(),
        "count=10".into(),
        "bpt=3".into(),
        "thr=3".into(),
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
    ]));
    assert_eq!(status, Category::Clean);
    assert_eq!(std::fs::read(&dst).unwrap(), data);

    let out_c = prepared.gs.out_side.lock().unwrap();
    assert_eq!(out_c.partial, 0);
    assert_eq!(out_c.rem, 0);
    drop(out_c);
    let in_c = prepared.gs.in_side.lock().unwrap();
    assert_eq!(in_c.partial, 0);
    assert_eq!(in_c.rem, 0);
}

#[test]
fn count_zero_runs_no_workers() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::write(&src, vec![9u8; 512]).unwrap();
    let (prepared, status) = run(&ops(&[
        "count=0".into(),
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
    ]));
    assert_eq!(status, Category::Clean);
    assert_eq!(std::fs::read(&dst).unwrap().len(), 0);
    assert_eq!(
        prepared
            .gs
            .pos_index
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[test]
fn one_block_many_threads() {
    // count=1 bpt=1 thr=16: exactly one worker moves one block, the others
    // find the input exhausted and exit.
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::write(&src, vec![0xa5u8; 512]).unwrap();
    let (prepared, status) = run(&ops(&[
        "bs=512".into(),
        "count=1".into(),
        "bpt=1".into(),
        "thr=16".into(),
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
    ]));
    assert_eq!(status, Category::Clean);
    assert_eq!(std::fs::read(&dst).unwrap(), vec![0xa5u8; 512]);
    assert_eq!(prepared.gs.out_side.lock().unwrap().rem, 0);
}

#[test]
fn skip_and_seek_offset_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..8 * 512).map(|i| (i / 512) as u8).collect();
    std::fs::write(&src, &data).unwrap();
    // Pre-fill two blocks of the destination so the seek landing is visible.
    std::fs::write(&dst, vec![0xff; 2 * 512]).unwrap();

    let (_prepared, status) = run(&ops(&[
        "bs=512".into(),
        "count=4".into(),
        "bpt=2".into(),
        "thr=2".into(),
        "skip=3".into(),
        "seek=2".into(),
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
    ]));
    assert_eq!(status, Category::Clean);
    let got = std::fs::read(&dst).unwrap();
    assert_eq!(got.len(), 6 * 512);
    assert!(got[..2 * 512].iter().all(|&b| b == 0xff));
    // blocks 3..7 of the source land at blocks 2..6 of the destination
    assert_eq!(&got[2 * 512..], &data[3 * 512..7 * 512]);
}

#[test]
fn register_file_sees_every_read() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let reg = dir.path().join("reg");
    let data: Vec<u8> = (0..6 * 512).map(|i| (i % 251) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let (_prepared, status) = run(&ops(&[
        "bs=512".into(),
        "count=6".into(),
        "bpt=2".into(),
        "thr=2".into(),
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
        format!("ofreg={}", reg.display()),
    ]));
    assert_eq!(status, Category::Clean);
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    // Register writes are gated by the same ordering condvar, so the copy
    // arrives in block order too.
    assert_eq!(std::fs::read(&reg).unwrap(), data);
}

#[test]
fn null_output_only_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::write(&src, vec![3u8; 4 * 512]).unwrap();
    let (prepared, status) = run(&ops(&[
        "count=4".into(),
        format!("if={}", src.display()),
        "of=.".into(),
    ]));
    assert_eq!(status, Category::Clean);
    assert_eq!(prepared.gs.out_side.lock().unwrap().rem, 0);
    assert_eq!(prepared.gs.in_side.lock().unwrap().rem, 0);
}

#[test]
fn large_copy_many_threads_stays_ordered() {
    // A larger sweep: 1009 blocks (prime, forces a ragged tail) through 8
    // workers with a small segment size.
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let blocks = 1009usize;
    let data: Vec<u8> = (0..blocks * 512)
        .map(|i| ((i / 512) % 256) as u8 ^ (i % 7) as u8)
        .collect();
    std::fs::write(&src, &data).unwrap();

    let (prepared, status) = run(&ops(&[
        "bs=512".into(),
        format!("count={blocks}"),
        "bpt=5".into(),
        "thr=8".into(),
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
    ]));
    assert_eq!(status, Category::Clean);
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    assert_eq!(prepared.gs.out_side.lock().unwrap().rem, 0);
    assert_eq!(prepared.gs.in_side.lock().unwrap().partial, 0);
}

#[test]
fn missing_count_over_regular_files_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::write(&src, vec![0u8; 512]).unwrap();
    let opts = args::parse_operands(&[
        format!("if={}", src.display()),
        format!("of={}", dst.display()),
    ])
    .unwrap();
    let res = setup::prepare(opts);
    assert!(matches!(res, Err(sgdd::error::SetupError::CountUnknown)));
}
