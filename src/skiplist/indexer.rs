//! Per-bucket indexers accelerating [`super::IndexedSkipList`] scans.
//!
//! Every indexer must never produce a false "skip" for a bucket that
//! actually contains a matching item — false positives (unnecessary scans)
//! are fine, false negatives are not.

use crate::far::ByteRange;

/// What a query asks indexers about: an overlapping byte range, plus an
/// optional transaction id filter.
#[derive(Clone, Copy, Debug)]
pub struct RangeQuery {
    pub range: ByteRange,
    pub tid: Option<u64>,
}

/// Anything storable in an [`super::IndexedSkipList`] exposes its own range
/// and owning transaction id so indexers can fold it in on insert.
pub trait Ranged {
    fn range(&self) -> ByteRange;
    fn tid(&self) -> u64;
}

pub trait Indexer<T>: Send {
    fn index(&mut self, item: &T);
    /// `true` means "might match, scan the bucket"; `false` means "cannot
    /// possibly match, skip the bucket entirely".
    fn check(&self, query: &RangeQuery) -> bool;
}

const GRID_CELL: u64 = 4096;

fn cell_mask(pos: u64, count: u32) -> u64 {
    if count == 0 {
        return 0;
    }
    let first = pos / GRID_CELL;
    let last = (pos + count as u64 - 1) / GRID_CELL;
    let mut mask = 0u64;
    // Bound the number of cells folded in so a pathologically large range
    // can't spin forever; beyond 64 distinct cells every bit is touched
    // anyway, which only widens (never narrows) the filter.
    for cell in first..=last.min(first + 64) {
        mask |= 1u64 << (cell % 64);
    }
    mask
}

/// Grid-based range Bloom filter: accumulates which coarse address cells any
/// inserted range has touched; a query is pruned only if it shares no cell
/// with anything ever inserted.
#[derive(Default)]
pub struct RangeBloomIndexer {
    mask: u64,
}

impl RangeBloomIndexer {
    pub fn new() -> Self {
        RangeBloomIndexer { mask: 0 }
    }
}

impl<T: Ranged> Indexer<T> for RangeBloomIndexer {
    fn index(&mut self, item: &T) {
        let r = item.range();
        self.mask |= cell_mask(r.pos, r.count);
    }

    fn check(&self, query: &RangeQuery) -> bool {
        if self.mask == 0 {
            return false;
        }
        self.mask & cell_mask(query.range.pos, query.range.count) != 0
    }
}

/// Exact min/max left/right edge tracker: rejects queries disjoint from the
/// union envelope of everything inserted.
pub struct MinMaxIndexer {
    min_pos: u64,
    max_end: u64,
    any: bool,
}

impl Default for MinMaxIndexer {
    fn default() -> Self {
        MinMaxIndexer {
            min_pos: u64::MAX,
            max_end: 0,
            any: false,
        }
    }
}

impl MinMaxIndexer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Ranged> Indexer<T> for MinMaxIndexer {
    fn index(&mut self, item: &T) {
        let r = item.range();
        self.min_pos = self.min_pos.min(r.pos);
        self.max_end = self.max_end.max(r.end());
        self.any = true;
    }

    fn check(&self, query: &RangeQuery) -> bool {
        if !self.any {
            return false;
        }
        query.range.pos < self.max_end && query.range.end() > self.min_pos
    }
}

/// Bloom filter over transaction ids, used when a query wants only a
/// specific `tid`'s blocks.
#[derive(Default)]
pub struct TidBloomIndexer {
    mask: u64,
}

impl TidBloomIndexer {
    pub fn new() -> Self {
        TidBloomIndexer { mask: 0 }
    }

    fn bit(tid: u64) -> u64 {
        1u64 << (tid % 64)
    }
}

impl<T: Ranged> Indexer<T> for TidBloomIndexer {
    fn index(&mut self, item: &T) {
        self.mask |= Self::bit(item.tid());
    }

    fn check(&self, query: &RangeQuery) -> bool {
        match query.tid {
            None => true,
            Some(tid) => self.mask & Self::bit(tid) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        range: ByteRange,
        tid: u64,
    }
    impl Ranged for Item {
        fn range(&self) -> ByteRange {
            self.range
        }
        fn tid(&self) -> u64 {
            self.tid
        }
    }

    #[test]
    fn minmax_rejects_disjoint() {
        let mut idx = MinMaxIndexer::new();
        Indexer::<Item>::index(&mut idx, &Item { range: ByteRange::new(100, 10), tid: 1 });
        let q_overlap = RangeQuery { range: ByteRange::new(105, 10), tid: None };
        let q_disjoint = RangeQuery { range: ByteRange::new(1000, 10), tid: None };
        assert!(Indexer::<Item>::check(&idx, &q_overlap));
        assert!(!Indexer::<Item>::check(&idx, &q_disjoint));
    }

    #[test]
    fn bloom_never_false_negative_on_same_cell() {
        let mut idx = RangeBloomIndexer::new();
        Indexer::<Item>::index(&mut idx, &Item { range: ByteRange::new(4096 * 3 + 10, 20), tid: 1 });
        let q = RangeQuery { range: ByteRange::new(4096 * 3 + 15, 5), tid: None };
        assert!(Indexer::<Item>::check(&idx, &q));
    }

    #[test]
    fn tid_bloom_filters_by_tid() {
        let mut idx = TidBloomIndexer::new();
        Indexer::<Item>::index(&mut idx, &Item { range: ByteRange::new(0, 1), tid: 42 });
        let hit = RangeQuery { range: ByteRange::new(0, 1), tid: Some(42) };
        let miss = RangeQuery { range: ByteRange::new(0, 1), tid: Some(7) };
        assert!(Indexer::<Item>::check(&idx, &hit));
        assert!(!Indexer::<Item>::check(&idx, &miss));
    }
}
