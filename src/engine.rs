//! `EventSourcingSegmentManager`: the public transactional façade tying the
//! segment manager, heap allocator and MVCC history together.
//!
//! Grounded on `original_source/impl/op/vtm/EventSourcingSegmentManager.h`:
//! one write transaction per thread (re-entrant calls become save points),
//! at most one kind of transaction (read-only xor read-write) open at a
//! time across the whole manager, and a two-phase commit that first copies
//! every pending shadow back into the segment-backed address space and only
//! then releases the shadow's history entry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};
use crate::far::{ByteRange, FarAddr};
use crate::mvcc::{MemoryChangeHistory, MemoryRequestType, ReadIsolation, ShadowBuffer};
use crate::mvcc::transaction::{EndOfTransactionListener, PendingWrite, Transaction, TxnHandle};
use crate::segment::{SegmentManager, SegmentManagerConfig};
use crate::threadpool::ThreadPool;
use crate::topology::heap::HeapAllocator;
use crate::topology::{Slot, Topology};

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub segment: SegmentManagerConfig,
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            segment: SegmentManagerConfig::default(),
            worker_threads: 2,
        }
    }
}

/// A writable view onto a shadow buffer retained for a write transaction.
#[derive(Debug)]
pub struct WritableChunk {
    shadow: ShadowBuffer,
}

impl WritableChunk {
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.shadow.write_at(offset, data);
    }

    pub fn read(&self) -> Vec<u8> {
        self.shadow.to_vec()
    }

    pub fn len(&self) -> usize {
        self.shadow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shadow.is_empty()
    }
}

/// A point-in-time readonly copy of a block, isolated per the manager's
/// configured [`ReadIsolation`].
pub struct ReadonlyChunk {
    bytes: Vec<u8>,
    addr: FarAddr,
}

impl ReadonlyChunk {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// RAII guard marking one read-only transaction active; dropping it is the
/// only way to end one, so a panicking reader can never leak the count and
/// wedge every future write transaction behind [`Error::RoTransactionActive`].
pub struct RoTransactionGuard<'a> {
    engine: &'a EventSourcingSegmentManager,
}

impl Drop for RoTransactionGuard<'_> {
    fn drop(&mut self) {
        self.engine.ro_count.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct EventSourcingSegmentManager {
    segments: Arc<SegmentManager>,
    heap: Arc<HeapAllocator>,
    history: Arc<MemoryChangeHistory>,
    _pool: Arc<ThreadPool>,
    tid_gen: AtomicU64,
    write_transactions: Mutex<HashMap<ThreadId, Transaction>>,
    ro_count: AtomicU32,
    /// Fired on every root transaction's commit/rollback, before its shadows
    /// are released, per SPEC_FULL §4.7.
    end_listeners: Mutex<Vec<Box<dyn EndOfTransactionListener>>>,
}

impl EventSourcingSegmentManager {
    pub fn create(dir: impl AsRef<Path>, prefix: &str, config: EngineConfig) -> Result<Self> {
        let segments = Arc::new(SegmentManager::create(dir, prefix, config.segment)?);
        Self::wire(segments, config, true)
    }

    pub fn open(dir: impl AsRef<Path>, prefix: &str, config: EngineConfig) -> Result<Self> {
        let segments = Arc::new(SegmentManager::open(dir, prefix, config.segment)?);
        Self::wire(segments, config, false)
    }

    fn wire(segments: Arc<SegmentManager>, config: EngineConfig, fresh: bool) -> Result<Self> {
        let heap = Arc::new(HeapAllocator::new(Arc::clone(&segments)));
        // Segment 0 already exists by the time we get here (`create` makes
        // it, `open` discovers it). Only a brand new store needs it formatted
        // as one fresh free block; an opened store must attach to whatever
        // free list and block chain are already persisted there instead of
        // overwriting them.
        if fresh {
            Slot::on_new_segment(&heap, 0)?;
        } else {
            Slot::open(&heap)?;
        }

        let mut topology = Topology::new();
        topology.push(Box::new(Arc::clone(&heap)));
        topology.open_all()?;
        segments.register_listener(Box::new(topology));

        let pool = Arc::new(ThreadPool::new(config.worker_threads.max(1)));
        let history = Arc::new(MemoryChangeHistory::new(Arc::clone(&pool)));

        Ok(EventSourcingSegmentManager {
            segments,
            heap,
            history,
            _pool: pool,
            tid_gen: AtomicU64::new(1),
            write_transactions: Mutex::new(HashMap::new()),
            ro_count: AtomicU32::new(0),
            end_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn read_isolation(&self, level: ReadIsolation) -> ReadIsolation {
        self.history.read_isolation(level)
    }

    /// Register a listener fired on every subsequent root transaction's
    /// commit or rollback, before its shadows are released.
    pub fn register_end_of_transaction_listener(&self, listener: Box<dyn EndOfTransactionListener>) {
        self.end_listeners.lock().unwrap().push(listener);
    }

    fn notify_commit(&self, tid: u64) {
        for l in self.end_listeners.lock().unwrap().iter() {
            l.on_commit(tid);
        }
    }

    fn notify_rollback(&self, tid: u64) {
        for l in self.end_listeners.lock().unwrap().iter() {
            l.on_rollback(tid);
        }
    }

    pub fn allocate(&self, len: u32) -> Result<FarAddr> {
        self.heap.allocate(len)
    }

    pub fn deallocate(&self, addr: FarAddr) -> Result<()> {
        self.heap.deallocate(addr)
    }

    pub fn flush(&self) -> Result<()> {
        self.segments.flush()
    }

    /// Begin a write transaction. Re-entering on the same thread opens a
    /// nested save point instead of a second independent transaction.
    pub fn begin_transaction(&self) -> Result<TxnHandle> {
        if self.ro_count.load(Ordering::Acquire) > 0 {
            return Err(Error::RoTransactionActive);
        }
        let key = thread::current().id();
        let mut table = self.write_transactions.lock().unwrap();
        if let Some(txn) = table.get_mut(&key) {
            let start = txn.pending.len();
            txn.depth += 1;
            return Ok(TxnHandle::SavePoint { tid: txn.id, start });
        }
        let tid = self.tid_gen.fetch_add(1, Ordering::Relaxed);
        self.history.on_new_transaction(tid);
        table.insert(key, Transaction::new(tid));
        Ok(TxnHandle::Root(tid))
    }

    /// Begin a read-only transaction. Rejected while any write transaction
    /// is open anywhere in the manager, matching the original's mutually
    /// exclusive read-only/read-write modes.
    pub fn begin_ro_transaction(&self) -> Result<RoTransactionGuard<'_>> {
        let table = self.write_transactions.lock().unwrap();
        if !table.is_empty() {
            return Err(Error::WriteTransactionActive);
        }
        drop(table);
        self.ro_count.fetch_add(1, Ordering::AcqRel);
        Ok(RoTransactionGuard { engine: self })
    }

    fn with_active_txn<R>(&self, tid: u64, f: impl FnOnce(&mut Transaction) -> Result<R>) -> Result<R> {
        let mut table = self.write_transactions.lock().unwrap();
        let txn = table
            .get_mut(&thread::current().id())
            .ok_or(Error::TransactionNotStarted)?;
        if txn.id != tid {
            return Err(Error::GhostState("transaction already sealed"));
        }
        f(txn)
    }

    /// Borrow `len` bytes at `addr` as a retained, writable shadow scoped to
    /// `handle`'s transaction. The write only lands in the segment-backed
    /// address space at `commit`.
    pub fn writable_block(&self, handle: &TxnHandle, addr: FarAddr, len: u32) -> Result<WritableChunk> {
        let tid = handle.tid();
        let init = self.segments.readonly_block(addr, len)?;
        let range = ByteRange::new(addr.raw(), len);
        let shadow = self.history.buffer_of_region(range, tid, MemoryRequestType::Wr, Some(&init))?;
        self.with_active_txn(tid, |txn| {
            txn.pending.push(PendingWrite {
                dest: addr,
                shadow: shadow.clone(),
            });
            Ok(())
        })?;
        Ok(WritableChunk { shadow })
    }

    /// Read `len` bytes at `addr`. With `handle` set, the read is isolated
    /// against that transaction's own and others' in-flight writes per the
    /// manager's [`ReadIsolation`]; with `handle` `None` it bypasses the
    /// history entirely and returns the raw committed bytes.
    pub fn readonly_block(&self, handle: Option<&TxnHandle>, addr: FarAddr, len: u32) -> Result<ReadonlyChunk> {
        let init = self.segments.readonly_block(addr, len)?;
        match handle {
            None => Ok(ReadonlyChunk { bytes: init, addr }),
            Some(h) => {
                let range = ByteRange::new(addr.raw(), len);
                let shadow = self.history.buffer_of_region(range, h.tid(), MemoryRequestType::Ro, Some(&init))?;
                Ok(ReadonlyChunk { bytes: shadow.to_vec(), addr })
            }
        }
    }

    /// Convert a previously read [`ReadonlyChunk`] into a writable shadow
    /// scoped to `handle`'s transaction. Simply re-requests a writable block
    /// at the chunk's own address and length, matching the original's
    /// `upgrade_to_writable_block` (itself a thin re-request over
    /// `writable_block`).
    pub fn upgrade_to_writable_block(&self, handle: &TxnHandle, ro: ReadonlyChunk) -> Result<WritableChunk> {
        self.writable_block(handle, ro.addr, ro.bytes.len() as u32)
    }

    pub fn commit(&self, handle: TxnHandle) -> Result<()> {
        match handle {
            TxnHandle::Root(tid) => {
                let pending = self.take_root_transaction(tid)?;
                self.notify_commit(tid);
                for pw in pending {
                    self.segments.write_block(pw.dest, &pw.shadow.to_vec())?;
                    self.history.destroy(tid, pw.shadow);
                }
                self.history.on_commit(tid);
                Ok(())
            }
            TxnHandle::SavePoint { tid, .. } => self.with_active_txn(tid, |txn| {
                // Nested transactions have no physical effect of their own;
                // their writes simply remain queued for the outer commit.
                txn.depth = txn.depth.saturating_sub(1);
                Ok(())
            }),
        }
    }

    pub fn rollback(&self, handle: TxnHandle) -> Result<()> {
        match handle {
            TxnHandle::Root(tid) => {
                let pending = self.take_root_transaction(tid)?;
                self.notify_rollback(tid);
                for pw in pending {
                    self.history.destroy(tid, pw.shadow);
                }
                self.history.on_rollback(tid);
                Ok(())
            }
            TxnHandle::SavePoint { tid, start } => self.with_active_txn(tid, |txn| {
                for pw in txn.pending.drain(start..) {
                    self.history.destroy(tid, pw.shadow);
                }
                txn.depth = txn.depth.saturating_sub(1);
                Ok(())
            }),
        }
    }

    /// Remove the calling thread's root transaction from the table and hand
    /// back its queued writes, all under one lock acquisition so a
    /// same-thread re-entrant `begin_transaction` can never observe it in a
    /// sealed-but-still-present state.
    fn take_root_transaction(&self, tid: u64) -> Result<Vec<PendingWrite>> {
        let mut table = self.write_transactions.lock().unwrap();
        let key = thread::current().id();
        let txn = table.get(&key).ok_or(Error::TransactionNotStarted)?;
        if txn.id != tid {
            return Err(Error::GhostState("transaction already sealed"));
        }
        Ok(table.remove(&key).expect("just checked present").pending)
    }
}
