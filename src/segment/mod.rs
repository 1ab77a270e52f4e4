//! Segment manager: owns one growing, memory-mapped store file and hands
//! out byte-level access to fixed-size segments within it, addressed by
//! [`FarAddr`].
//!
//! Grounded on `original_source/impl/op/vtm/managers/BaseSegmentManager.h`:
//! the original wraps a single `boost::interprocess::file_mapping` and
//! caches lightweight per-index *views* into it, growing the one mapping as
//! segments are added rather than creating a new file per segment. This
//! port keeps the single-file model (`MmapFile::grow`, as `log/mod.rs`
//! already does for its own single-file record store) and drops the
//! earlier per-segment-file layout this crate started with.

pub mod header;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::far::FarAddr;
use crate::mmap::MmapFile;

use header::{SegmentHeader, SEGMENT_HEADER_LEN, SEGMENT_SIGNATURE};

#[derive(Clone, Copy, Debug)]
pub struct SegmentManagerConfig {
    pub segment_size: u32,
}

impl Default for SegmentManagerConfig {
    fn default() -> Self {
        SegmentManagerConfig {
            segment_size: 1 << 20, // 1 MiB
        }
    }
}

/// Callback fired after a new segment is published to disk and mapped.
pub trait SegmentListener: Send + Sync {
    fn on_segment_allocated(&self, index: u32);
}

fn store_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}.store"))
}

/// Owns a single growing file holding every fixed-size segment back to
/// back, and exposes byte-level read/write access to them via far
/// addresses.
pub struct SegmentManager {
    path: PathBuf,
    config: SegmentManagerConfig,
    map: RwLock<MmapFile>,
    /// Number of segments currently published (header written, listeners
    /// notified).
    count: AtomicU32,
    /// Serialises file growth (new segment creation).
    growth_lock: Mutex<()>,
    /// Registered behind a lock (not a plain `Vec`) so listeners can still be
    /// added after this manager has been wrapped in an `Arc` and shared with
    /// the allocators that need to hear about new segments.
    listeners: RwLock<Vec<Box<dyn SegmentListener>>>,
}

impl SegmentManager {
    /// Create a brand new, single-file segment store rooted at `dir`.
    pub fn create(dir: impl AsRef<Path>, prefix: &str, config: SegmentManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref()).map_err(Error::FileOpen)?;
        let path = store_path(dir.as_ref(), prefix);
        let map = MmapFile::create(&path, config.segment_size as usize)?;
        let mgr = SegmentManager {
            path,
            config,
            map: RwLock::new(map),
            count: AtomicU32::new(0),
            growth_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        };
        mgr.ensure_segment(0)?;
        Ok(mgr)
    }

    /// Open an existing segment store, discovering how many segments
    /// already exist from the file's current length.
    pub fn open(dir: impl AsRef<Path>, prefix: &str, config: SegmentManagerConfig) -> Result<Self> {
        let path = store_path(dir.as_ref(), prefix);
        let map = MmapFile::open(&path)?;
        let header = SegmentHeader::from_bytes(map.range(0, SEGMENT_HEADER_LEN)?)?;
        if header.segment_size != config.segment_size {
            return Err(Error::InvalidSignature("segment_size mismatch"));
        }
        let count = (map.len() as u64 / config.segment_size as u64) as u32;
        if count == 0 {
            return Err(Error::InvalidSignature("no segments found"));
        }
        Ok(SegmentManager {
            path,
            config,
            map: RwLock::new(map),
            count: AtomicU32::new(count),
            growth_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Register a listener to be notified of every subsequently allocated
    /// segment. Existing segments are not replayed; callers that need to
    /// act on segment 0 (already created by `create`) must do so up front.
    pub fn register_listener(&self, listener: Box<dyn SegmentListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn segment_size(&self) -> u32 {
        self.config.segment_size
    }

    pub fn available_segments(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Ensure segments `[0, index]` exist, growing the single backing file
    /// and publishing a fresh header for any that are missing.
    pub fn ensure_segment(&self, index: u32) -> Result<()> {
        if index < self.count.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.growth_lock.lock().unwrap();
        let mut current = self.count.load(Ordering::Acquire);
        let segment_size = self.config.segment_size as u64;
        while current <= index {
            let needed_len = (current as u64 + 1) * segment_size;
            {
                let mut map = self.map.write().unwrap();
                if needed_len > map.len() as u64 {
                    map.grow(needed_len as usize)?;
                }
                let header_offset = current as u64 * segment_size;
                let header = SegmentHeader::new(self.config.segment_size);
                map.range_mut(header_offset as usize, SEGMENT_HEADER_LEN)?
                    .copy_from_slice(&header.to_bytes());
                map.sync()?;
            }
            for l in self.listeners.read().unwrap().iter() {
                l.on_segment_allocated(current);
            }
            log::debug!("strata-vtm: allocated segment {current} ({} bytes)", self.config.segment_size);
            current += 1;
            self.count.store(current, Ordering::Release);
        }
        Ok(())
    }

    /// Translate a far address + length into an absolute byte offset into
    /// the single backing file, rejecting any block that would cross a
    /// segment boundary.
    fn abs_offset(&self, addr: FarAddr, len: u32) -> Result<usize> {
        if addr.is_nil() {
            return Err(Error::InvalidFarAddress);
        }
        let end = addr.offset() as u64 + len as u64;
        if end > self.config.segment_size as u64 {
            return Err(Error::InvalidFarAddress); // would cross segment boundary
        }
        let base = addr.segment() as u64 * self.config.segment_size as u64;
        Ok((base + addr.offset() as u64) as usize)
    }

    /// Borrow `len` bytes at `addr` for reading.
    pub fn readonly_block(&self, addr: FarAddr, len: u32) -> Result<Vec<u8>> {
        self.ensure_segment(addr.segment())?;
        let offset = self.abs_offset(addr, len)?;
        let map = self.map.read().unwrap();
        map.range(offset, len as usize).map(|s| s.to_vec())
    }

    /// Apply `f` to the writable bytes at `addr`, in place.
    pub fn with_writable_block<R>(&self, addr: FarAddr, len: u32, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.ensure_segment(addr.segment())?;
        let offset = self.abs_offset(addr, len)?;
        let mut map = self.map.write().unwrap();
        map.range_mut(offset, len as usize).map(f)
    }

    pub fn write_block(&self, addr: FarAddr, data: &[u8]) -> Result<()> {
        self.with_writable_block(addr, data.len() as u32, |dst| dst.copy_from_slice(data))
    }

    /// Convert a previously read block back into a writable view over the
    /// same live bytes. The default implementation simply re-requests the
    /// writable block at the same address and length; there is no retained
    /// readonly-chunk object at this layer to upgrade in place.
    pub fn upgrade_to_writable_block<R>(&self, addr: FarAddr, len: u32, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.with_writable_block(addr, len, f)
    }

    /// Sync the backing file's dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.read().unwrap().sync()
    }
}

pub const SEGMENT_PAYLOAD_START: u32 = SEGMENT_HEADER_LEN as u32;

/// Sanity check that `0xDEADF00D` is the expected signature constant used
/// across segment headers and tests referencing it by name.
pub const EXPECTED_SIGNATURE: u32 = SEGMENT_SIGNATURE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SegmentManagerConfig { segment_size: 4096 };
        {
            let mgr = SegmentManager::create(dir.path(), "t", cfg).unwrap();
            assert_eq!(mgr.available_segments(), 1);
            let addr = FarAddr::new(0, SEGMENT_PAYLOAD_START);
            mgr.write_block(addr, &[1, 2, 3, 4]).unwrap();
            mgr.flush().unwrap();
        }
        let mgr = SegmentManager::open(dir.path(), "t", cfg).unwrap();
        let addr = FarAddr::new(0, SEGMENT_PAYLOAD_START);
        let bytes = mgr.readonly_block(addr, 4).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn ensure_segment_grows_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SegmentManagerConfig { segment_size: 4096 };
        let mgr = SegmentManager::create(dir.path(), "t", cfg).unwrap();
        mgr.ensure_segment(3).unwrap();
        assert_eq!(mgr.available_segments(), 4);
        assert_eq!(std::fs::metadata(store_path(dir.path(), "t")).unwrap().len(), 4 * 4096);
    }

    #[test]
    fn block_crossing_segment_boundary_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SegmentManagerConfig { segment_size: 64 };
        let mgr = SegmentManager::create(dir.path(), "t", cfg).unwrap();
        let addr = FarAddr::new(0, 60);
        assert!(mgr.readonly_block(addr, 16).is_err());
    }

    #[test]
    fn second_segment_is_independently_addressable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SegmentManagerConfig { segment_size: 128 };
        let mgr = SegmentManager::create(dir.path(), "t", cfg).unwrap();
        mgr.ensure_segment(1).unwrap();
        let a0 = FarAddr::new(0, SEGMENT_PAYLOAD_START);
        let a1 = FarAddr::new(1, SEGMENT_PAYLOAD_START);
        mgr.write_block(a0, &[1, 2, 3, 4]).unwrap();
        mgr.write_block(a1, &[5, 6, 7, 8]).unwrap();
        assert_eq!(mgr.readonly_block(a0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(mgr.readonly_block(a1, 4).unwrap(), vec![5, 6, 7, 8]);
    }
}
