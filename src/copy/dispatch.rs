//! Segment dispatch: atomically hand the next `[start, blocks]` span of the
//! copy to whichever worker asks first.
//!
//! The offset comes from a lock-free `fetch_add` on `pos_index`; the
//! remaining-block budget and stop flag are checked under the input mutex the
//! caller already holds, which also covers the `count` decrement.

use crate::copy::state::{GlobalState, InCounters};

/// One unit of work for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset in blocks from the start of the copy.
    pub pos: i64,
    pub blocks: u32,
    /// Source LBA (`skip + pos`); fixed at assignment.
    pub iblk: i64,
    /// Destination LBA (`seek + pos`); fixed at assignment.
    pub oblk: i64,
}

/// Claim the next segment. Returns `None` when the input is exhausted or
/// stopped. Must be called with the input mutex held; decrements the
/// dispatch budget on success.
pub fn next_segment(gs: &GlobalState, in_c: &mut InCounters) -> Option<Segment> {
    let pos = gs
        .pos_index
        .fetch_add(gs.bpt as i64, std::sync::atomic::Ordering::SeqCst);
    if in_c.stop || in_c.count <= 0 {
        return None;
    }
    let blocks = if gs.total >= 0 {
        if pos >= gs.total {
            return None;
        }
        (gs.total - pos).min(gs.bpt as i64) as u32
    } else {
        gs.bpt as u32
    };
    in_c.count -= i64::from(blocks);
    Some(Segment {
        pos,
        blocks,
        iblk: gs.skip + pos,
        oblk: gs.seek + pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(total: i64, bpt: usize) -> GlobalState {
        GlobalState::new(512, bpt, total, 100, 200)
    }

    #[test]
    fn test_segments_tile_the_copy() {
        let gs = state(10, 3);
        let mut in_c = gs.in_side.lock().unwrap();
        let segs: Vec<_> = std::iter::from_fn(|| next_segment(&gs, &mut in_c)).collect();
        assert_eq!(segs.len(), 4);
        assert_eq!(
            segs.iter().map(|s| s.pos).collect::<Vec<_>>(),
            vec![0, 3, 6, 9]
        );
        assert_eq!(
            segs.iter().map(|s| s.blocks).collect::<Vec<_>>(),
            vec![3, 3, 3, 1]
        );
        assert_eq!(in_c.count, 0);
    }

    #[test]
    fn test_lbas_offset_by_skip_and_seek() {
        let gs = state(6, 4);
        let mut in_c = gs.in_side.lock().unwrap();
        let s = next_segment(&gs, &mut in_c).unwrap();
        assert_eq!(s.iblk, 100);
        assert_eq!(s.oblk, 200);
        let s = next_segment(&gs, &mut in_c).unwrap();
        assert_eq!(s.iblk, 104);
        assert_eq!(s.oblk, 204);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let gs = state(4, 4);
        let mut in_c = gs.in_side.lock().unwrap();
        assert!(next_segment(&gs, &mut in_c).is_some());
        assert!(next_segment(&gs, &mut in_c).is_none());
        assert!(next_segment(&gs, &mut in_c).is_none());
    }

    #[test]
    fn test_stop_flag_blocks_dispatch() {
        let gs = state(100, 4);
        let mut in_c = gs.in_side.lock().unwrap();
        in_c.stop = true;
        assert!(next_segment(&gs, &mut in_c).is_none());
    }

    #[test]
    fn test_zero_count_dispatches_nothing() {
        let gs = state(0, 4);
        let mut in_c = gs.in_side.lock().unwrap();
        assert!(next_segment(&gs, &mut in_c).is_none());
    }

    #[test]
    fn test_concurrent_positions_unique() {
        use std::sync::Arc;
        let gs = Arc::new(state(10_000, 7));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gs = gs.clone();
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    let mut in_c = gs.in_side.lock().unwrap();
                    match next_segment(&gs, &mut in_c) {
                        Some(s) => got.push(s.pos),
                        None => break,
                    }
                }
                got
            }));
        }
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let expect: Vec<i64> = (0..).map(|i| i * 7).take_while(|p| *p < 10_000).collect();
        assert_eq!(all, expect);
    }
}
