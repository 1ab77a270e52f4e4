//! Fixed-size pool allocator slot: O(1) alloc/free of same-sized items via a
//! singly-linked free list threaded through the free slots themselves.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::far::{align_up, FarAddr};
use crate::segment::header::SEGMENT_HEADER_LEN;
use crate::segment::SegmentManager;

use super::Slot;

/// Process-wide free-list head, stored once in segment 0 right after the
/// segment header. Each pool instance reserves its own 8-byte slot there,
/// selected by `head_slot_index`.
fn head_addr(head_slot_index: u32) -> FarAddr {
    FarAddr::new(0, SEGMENT_HEADER_LEN as u32 + head_slot_index * 8)
}

fn read_u64(mgr: &SegmentManager, addr: FarAddr) -> Result<u64> {
    let bytes = mgr.readonly_block(addr, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn write_u64(mgr: &SegmentManager, addr: FarAddr, v: u64) -> Result<()> {
    mgr.write_block(addr, &v.to_le_bytes())
}

/// A free slot's payload is overwritten with `{ next: FarAddr, adjacent_count: u32 }`.
/// `adjacent_count` lets a freshly formatted segment publish a single node
/// representing `N` consecutive free slots instead of threading all `N`
/// individually.
struct FreeNode {
    next: FarAddr,
    adjacent_count: u32,
}

const FREE_NODE_LEN: u32 = 16;

impl FreeNode {
    fn to_bytes(&self) -> [u8; FREE_NODE_LEN as usize] {
        let mut buf = [0u8; FREE_NODE_LEN as usize];
        buf[0..8].copy_from_slice(&self.next.raw().to_le_bytes());
        buf[8..12].copy_from_slice(&self.adjacent_count.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let next = FarAddr::from_raw(u64::from_le_bytes(buf[0..8].try_into().unwrap()));
        let adjacent_count = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        FreeNode { next, adjacent_count }
    }
}

/// Allocator for fixed-size `item_size`-byte items, `items_per_segment` of
/// them per segment, identified by a unique `head_slot_index` reserved in
/// segment 0's free-list-head table.
pub struct PoolAllocator {
    mgr: Arc<SegmentManager>,
    head_slot_index: u32,
    item_size: u32,
    items_per_segment: u32,
    lock: Mutex<()>,
}

impl PoolAllocator {
    pub fn new(mgr: Arc<SegmentManager>, head_slot_index: u32, item_size: u32, items_per_segment: u32) -> Self {
        let item_size = align_up(item_size.max(FREE_NODE_LEN));
        PoolAllocator {
            mgr,
            head_slot_index,
            item_size,
            items_per_segment,
            lock: Mutex::new(()),
        }
    }

    pub fn item_size(&self) -> u32 {
        self.item_size
    }

    fn region_start(&self, segment_index: u32) -> u32 {
        // Segment 0 reserves the header-table entry used by every pool, so
        // pool item regions all start right after the segment header; which
        // pool owns which bytes is tracked by the caller's topology layout,
        // this type only knows its own region bounds once positioned there.
        let _ = segment_index;
        SEGMENT_HEADER_LEN as u32
    }

    fn publish_new_run(&self, segment_index: u32) -> Result<()> {
        let base = FarAddr::new(segment_index, self.region_start(segment_index));
        let node = FreeNode {
            next: FarAddr::from_raw(read_u64(&self.mgr, head_addr(self.head_slot_index))?),
            adjacent_count: self.items_per_segment - 1,
        };
        self.mgr.write_block(base, &node.to_bytes())?;
        write_u64(&self.mgr, head_addr(self.head_slot_index), base.raw())
    }

    pub fn allocate(&self) -> Result<FarAddr> {
        for attempt in 0..2 {
            {
                let _guard = self.lock.lock().unwrap();
                let head = FarAddr::from_raw(read_u64(&self.mgr, head_addr(self.head_slot_index))?);
                if !head.is_nil() {
                    let bytes = self.mgr.readonly_block(head, FREE_NODE_LEN)?;
                    let node = FreeNode::from_bytes(&bytes);
                    if node.adjacent_count > 0 {
                        let advanced = head.advance(self.item_size, self.mgr.segment_size())?;
                        let remaining = FreeNode {
                            next: node.next,
                            adjacent_count: node.adjacent_count - 1,
                        };
                        self.mgr.write_block(advanced, &remaining.to_bytes())?;
                        write_u64(&self.mgr, head_addr(self.head_slot_index), advanced.raw())?;
                    } else {
                        write_u64(&self.mgr, head_addr(self.head_slot_index), node.next.raw())?;
                    }
                    return Ok(head);
                }
            }
            if attempt == 0 {
                // Dropped the guard above before growing, matching the heap
                // allocator: `ensure_segment` fires the registered
                // `SegmentListener` chain on this same thread, which (once
                // this pool is pushed into a `Topology`) dispatches back into
                // this pool's own `on_new_segment` and that takes `self.lock`
                // itself. Publishing the run here too, on top of the
                // listener's publish, would double-publish it; growth is
                // left entirely to the listener callback, the same as the
                // heap allocator's own formatting.
                let next_index = self.mgr.available_segments();
                self.mgr.ensure_segment(next_index)?;
            }
        }
        Err(Error::NoMemory)
    }

    pub fn deallocate(&self, addr: FarAddr) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let head = FarAddr::from_raw(read_u64(&self.mgr, head_addr(self.head_slot_index))?);
        let node = FreeNode {
            next: head,
            adjacent_count: 0,
        };
        self.mgr.write_block(addr, &node.to_bytes())?;
        write_u64(&self.mgr, head_addr(self.head_slot_index), addr.raw())
    }
}

impl Slot for PoolAllocator {
    fn byte_size(&self) -> u32 {
        self.item_size * self.items_per_segment
    }

    fn on_new_segment(&self, segment_index: u32) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        self.publish_new_run(segment_index)
    }

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) {}
}
