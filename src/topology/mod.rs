//! Slot topology: an ordered list of allocators that each reserve a
//! byte region inside every segment. Replaces the original's
//! template-metaprogrammed slot tuple with a trait object list, per the
//! "templates -> trait + compile-time list" redesign note.

pub mod heap;
pub mod pool;

use std::sync::Arc;

use crate::error::Result;
use crate::segment::SegmentListener;

/// A logical allocator that may reside inside every segment at a
/// slot-specific offset.
pub trait Slot: Send + Sync {
    /// Whether this slot reserves a region in every segment (some slots,
    /// e.g. ones whose state lives entirely in segment 0, do not).
    fn has_residence(&self) -> bool {
        true
    }

    /// Bytes this slot reserves per segment, 0 if `has_residence` is false.
    fn byte_size(&self) -> u32;

    /// Called once, synchronously, right after a new segment is created and
    /// published.
    fn on_new_segment(&self, segment_index: u32) -> Result<()>;

    /// Called once when an existing segment-managed file is opened, after
    /// all pre-existing segments are discovered.
    fn open(&self) -> Result<()>;

    fn release(&self);
}

/// Dispatches segment-lifecycle notifications to every registered slot.
/// Registered with a [`crate::segment::SegmentManager`] as its single
/// [`SegmentListener`].
pub struct Topology {
    slots: Vec<Box<dyn Slot>>,
}

impl Topology {
    pub fn new() -> Self {
        Topology { slots: Vec::new() }
    }

    pub fn push(&mut self, slot: Box<dyn Slot>) {
        self.slots.push(slot);
    }

    pub fn open_all(&self) -> Result<()> {
        for s in &self.slots {
            s.open()?;
        }
        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentListener for Topology {
    fn on_segment_allocated(&self, index: u32) {
        for s in &self.slots {
            if s.has_residence() {
                if let Err(e) = s.on_new_segment(index) {
                    log::error!("strata-vtm: slot failed to attach to segment {index}: {e}");
                }
            }
        }
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        for s in &self.slots {
            s.release();
        }
    }
}

/// Lets a shared allocator (held elsewhere for direct `allocate`/`deallocate`
/// calls) also be pushed into a [`Topology`] as a slot, without the topology
/// taking sole ownership of it.
impl Slot for Arc<heap::HeapAllocator> {
    fn byte_size(&self) -> u32 {
        (**self).byte_size()
    }

    fn on_new_segment(&self, segment_index: u32) -> Result<()> {
        (**self).on_new_segment(segment_index)
    }

    fn open(&self) -> Result<()> {
        (**self).open()
    }

    fn release(&self) {
        (**self).release()
    }
}

impl Slot for Arc<pool::PoolAllocator> {
    fn byte_size(&self) -> u32 {
        (**self).byte_size()
    }

    fn on_new_segment(&self, segment_index: u32) -> Result<()> {
        (**self).on_new_segment(segment_index)
    }

    fn open(&self) -> Result<()> {
        (**self).open()
    }

    fn release(&self) {
        (**self).release()
    }
}
