//! Per-transaction bookkeeping: pending writes and savepoint nesting.
//!
//! Grounded on `original_source/impl/op/vtm/EventSourcingSegmentManager.h`'s
//! transaction table, which keys open transactions by owning thread and
//! tracks a stack depth for nested (savepoint) transactions on the same
//! thread. This port keeps that same-thread-reentry model but replaces the
//! original's recursive-mutex-guarded map with a plain `HashMap` behind the
//! engine's own lock.

use crate::far::FarAddr;
use crate::mvcc::shadow::ShadowBuffer;

/// Callback registered against a transaction, fired once it ends, before its
/// shadows are released.
pub trait EndOfTransactionListener: Send + Sync {
    fn on_commit(&self, tid: u64);
    fn on_rollback(&self, tid: u64);
}

/// One write queued against a transaction: where it must land in the
/// segment-backed address space once committed, and the shadow buffer
/// holding its (possibly still-being-written) bytes until then.
pub struct PendingWrite {
    pub dest: FarAddr,
    pub shadow: ShadowBuffer,
}

/// A root transaction together with every savepoint nested inside it. Only
/// the root physically commits or rolls back against the segment manager;
/// savepoints just truncate `pending` back to where they started.
///
/// There is no explicit `Active -> SealedRollbackOnly -> SealedNoop` state
/// machine here: a transaction's sole liveness signal is its presence in the
/// engine's transaction table. `commit`/`rollback` remove it from that table
/// under the same lock they use to look it up, so a second `commit` or
/// `rollback` call for the same `tid` always observes "not present" and
/// fails with [`crate::error::Error::GhostState`] — the ghost-state check the
/// original's explicit state machine exists for, with nothing left to get out
/// of sync.
pub struct Transaction {
    pub id: u64,
    pub pending: Vec<PendingWrite>,
    /// Number of `begin_transaction` calls on this thread still open,
    /// including the root. Reaching zero on `commit`/`rollback` means the
    /// thread has fully exited the transaction.
    pub depth: u32,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Transaction {
            id,
            pending: Vec::new(),
            depth: 1,
        }
    }
}

/// Handle returned by `begin_transaction`/`begin_ro_transaction`, identifying
/// which logical transaction a later `commit`/`rollback`/`writable_block`
/// call applies to.
#[derive(Clone, Copy, Debug)]
pub enum TxnHandle {
    /// A fresh, top-level transaction.
    Root(u64),
    /// A nested call on a thread that already holds a transaction open;
    /// `start` is the `pending` length to truncate back to on rollback.
    SavePoint { tid: u64, start: usize },
}

impl TxnHandle {
    pub fn tid(&self) -> u64 {
        match self {
            TxnHandle::Root(tid) => *tid,
            TxnHandle::SavePoint { tid, .. } => *tid,
        }
    }
}
