//! Bucketed, indexed, append-mostly container.
//!
//! Grounded on `original_source/impl/op/vtm/managers/BucketIndexedList.h`.
//! The original threads lock-free atomics through raw pointers; this port
//! follows SPEC_FULL §9's redesign note and models each bucket as a plain
//! struct behind a mutex instead, trading the original's per-slot atomics
//! for a coarser per-bucket lock. Behaviourally equivalent: presence is
//! still tracked per-slot (`Option::None` standing in for a cleared
//! presence bit), buckets still go `garbage` once empty and get physically
//! reclaimed by `clean`.

pub mod indexer;

use std::sync::{Mutex, RwLock};

pub use indexer::{Indexer, RangeQuery, Ranged};

#[derive(PartialEq, Eq, Clone, Copy)]
enum Status {
    Valid,
    Garbage,
}

struct Bucket<T> {
    status: Status,
    data: Vec<Option<T>>,
    size: usize,
    capacity: usize,
    indexers: Vec<Box<dyn Indexer<T> + Send>>,
}

impl<T: Ranged> Bucket<T> {
    fn new(capacity: usize, indexers: Vec<Box<dyn Indexer<T> + Send>>) -> Self {
        let mut data = Vec::with_capacity(capacity);
        data.resize_with(capacity, || None);
        Bucket {
            status: Status::Valid,
            data,
            size: 0,
            capacity,
            indexers,
        }
    }

    fn try_insert(&mut self, item: T) -> Option<T> {
        if self.status == Status::Garbage || self.size >= self.capacity {
            return Some(item);
        }
        for indexer in &mut self.indexers {
            indexer.index(&item);
        }
        self.data[self.size] = Some(item);
        self.size += 1;
        None
    }

    fn bunch_for_each(&self, callback: &mut impl FnMut(&T) -> bool) -> bool {
        for slot in self.data[..self.size].iter() {
            if let Some(v) = slot {
                if !callback(v) {
                    return false;
                }
            }
        }
        true
    }

    fn soft_remove_if(&mut self, predicate: &impl Fn(&T) -> bool) -> usize {
        let mut removed = 0;
        for slot in self.data[..self.size].iter_mut() {
            if let Some(v) = slot {
                if predicate(v) {
                    *slot = None;
                    removed += 1;
                }
            }
        }
        if removed > 0 && self.data[..self.size].iter().all(Option::is_none) {
            self.status = Status::Garbage;
        }
        removed
    }

    fn passes_indexers(&self, query: &RangeQuery) -> bool {
        self.indexers.iter().all(|idx| idx.check(query))
    }
}

/// A thread-safe, append-mostly, bucketed container supporting indexed
/// overlap scans.
pub struct IndexedSkipList<T: Ranged> {
    buckets: RwLock<Vec<Mutex<Bucket<T>>>>,
    capacity: usize,
    make_indexers: Box<dyn Fn() -> Vec<Box<dyn Indexer<T> + Send>> + Send + Sync>,
}

impl<T: Ranged> IndexedSkipList<T> {
    pub fn new(
        capacity: usize,
        make_indexers: impl Fn() -> Vec<Box<dyn Indexer<T> + Send>> + Send + Sync + 'static,
    ) -> Self {
        IndexedSkipList {
            buckets: RwLock::new(Vec::new()),
            capacity,
            make_indexers: Box::new(make_indexers),
        }
    }

    /// Append `item`, creating a new bucket if every existing one is full.
    pub fn emplace(&self, mut item: T) {
        loop {
            {
                let buckets = self.buckets.read().unwrap();
                if let Some(last) = buckets.last() {
                    let mut b = last.lock().unwrap();
                    match b.try_insert(item) {
                        None => return,
                        Some(rejected) => item = rejected,
                    }
                }
            }
            let mut buckets = self.buckets.write().unwrap();
            // Re-check under the write lock: another thread may have already
            // appended a fresh bucket with room while we were upgrading.
            if let Some(last) = buckets.last() {
                let mut b = last.lock().unwrap();
                if let Some(rejected) = b.try_insert(item) {
                    item = rejected;
                } else {
                    return;
                }
            }
            buckets.push(Mutex::new(Bucket::new(self.capacity, (self.make_indexers)())));
        }
    }

    pub fn buckets_count(&self) -> usize {
        self.buckets.read().unwrap().len()
    }

    pub fn empty_buckets_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap()
            .iter()
            .filter(|b| b.lock().unwrap().status == Status::Garbage)
            .count()
    }

    pub fn for_each(&self, mut callback: impl FnMut(&T) -> bool) {
        let buckets = self.buckets.read().unwrap();
        for bucket in buckets.iter() {
            let b = bucket.lock().unwrap();
            if b.status == Status::Garbage {
                continue;
            }
            if !b.bunch_for_each(&mut callback) {
                break;
            }
        }
    }

    /// Scan only buckets whose indexers cannot rule `query` out.
    pub fn indexed_for_each(&self, query: &RangeQuery, mut callback: impl FnMut(&T) -> bool) {
        let buckets = self.buckets.read().unwrap();
        for bucket in buckets.iter() {
            let b = bucket.lock().unwrap();
            if b.status == Status::Garbage {
                continue;
            }
            if !b.passes_indexers(query) {
                continue;
            }
            if !b.bunch_for_each(&mut callback) {
                break;
            }
        }
    }

    /// Soft-remove every item matching `predicate` within buckets `query`
    /// cannot rule out. Returns the number of items removed.
    pub fn soft_remove_if(&self, query: &RangeQuery, predicate: impl Fn(&T) -> bool) -> usize {
        let buckets = self.buckets.read().unwrap();
        let mut total = 0;
        for bucket in buckets.iter() {
            let mut b = bucket.lock().unwrap();
            if b.status == Status::Garbage || !b.passes_indexers(query) {
                continue;
            }
            total += b.soft_remove_if(&predicate);
        }
        total
    }

    /// Physically remove up to `limit` garbage buckets. Returns the number
    /// removed.
    pub fn clean(&self, limit: usize) -> usize {
        let mut buckets = self.buckets.write().unwrap();
        let mut removed = 0;
        let mut i = 0;
        while i < buckets.len() && removed < limit {
            if buckets[i].lock().unwrap().status == Status::Garbage {
                buckets.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::far::ByteRange;
    use indexer::{MinMaxIndexer, RangeBloomIndexer, TidBloomIndexer};

    #[derive(Clone, PartialEq, Eq, Debug)]
    struct Item {
        range: ByteRange,
        tid: u64,
        id: u32,
    }
    impl Ranged for Item {
        fn range(&self) -> ByteRange {
            self.range
        }
        fn tid(&self) -> u64 {
            self.tid
        }
    }

    fn make_list(capacity: usize) -> IndexedSkipList<Item> {
        IndexedSkipList::new(capacity, || {
            vec![
                Box::new(RangeBloomIndexer::new()) as Box<dyn Indexer<Item> + Send>,
                Box::new(MinMaxIndexer::new()) as Box<dyn Indexer<Item> + Send>,
                Box::new(TidBloomIndexer::new()) as Box<dyn Indexer<Item> + Send>,
            ]
        })
    }

    #[test]
    fn overflow_creates_new_bucket() {
        let list = make_list(4);
        for i in 0..10u32 {
            list.emplace(Item {
                range: ByteRange::new(i as u64 * 16, 16),
                tid: 1,
                id: i,
            });
        }
        assert!(list.buckets_count() >= 3);
        let mut count = 0;
        list.for_each(|_| {
            count += 1;
            true
        });
        assert_eq!(count, 10);
    }

    #[test]
    fn indexed_scan_finds_overlap_and_prunes() {
        let list = make_list(8);
        for i in 0..100u32 {
            list.emplace(Item {
                range: ByteRange::new(i as u64 * 4096, 16),
                tid: 1,
                id: i,
            });
        }
        let query = RangeQuery {
            range: ByteRange::new(50 * 4096, 16),
            tid: None,
        };
        let mut found = Vec::new();
        list.indexed_for_each(&query, |item| {
            found.push(item.id);
            true
        });
        assert!(found.contains(&50));
    }

    #[test]
    fn soft_remove_then_clean_evicts_bucket() {
        let list = make_list(2);
        list.emplace(Item { range: ByteRange::new(0, 4), tid: 1, id: 1 });
        list.emplace(Item { range: ByteRange::new(4, 4), tid: 1, id: 2 });
        let query = RangeQuery { range: ByteRange::new(0, 8), tid: None };
        let removed = list.soft_remove_if(&query, |_| true);
        assert_eq!(removed, 2);
        assert_eq!(list.empty_buckets_count(), 1);
        assert_eq!(list.clean(10), 1);
        assert_eq!(list.buckets_count(), 0);
    }
}
