//! Thin wrapper around a file-backed writable memory mapping.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Create (or truncate) `path` to exactly `len` bytes and map it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::FileOpen)?;
        file.set_len(len as u64).map_err(Error::WriteFile)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(Error::MemoryMapping)?;
        Ok(MmapFile { file, map, len })
    }

    /// Open an existing file and map its current length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::FileOpen)?;
        let len = file.metadata().map_err(Error::ReadFile)?.len() as usize;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(Error::MemoryMapping)?;
        Ok(MmapFile { file, map, len })
    }

    /// Grow the backing file to `new_len` and remap it. `new_len` must be
    /// greater than the current length.
    pub fn grow(&mut self, new_len: usize) -> Result<()> {
        debug_assert!(new_len >= self.len);
        self.file.set_len(new_len as u64).map_err(Error::WriteFile)?;
        let map = unsafe { MmapOptions::new().len(new_len).map_mut(&self.file) }.map_err(Error::MemoryMapping)?;
        self.map = map;
        self.len = new_len;
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..]
    }

    /// Bounds-checked immutable view of `[offset, offset+len)`.
    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::InvalidFarAddress)?;
        if end > self.len {
            return Err(Error::InvalidFarAddress);
        }
        Ok(&self.map[offset..end])
    }

    /// Bounds-checked mutable view of `[offset, offset+len)`.
    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::InvalidFarAddress)?;
        if end > self.len {
            return Err(Error::InvalidFarAddress);
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush().map_err(Error::WriteFile)
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async().map_err(Error::WriteFile)
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush().map_err(Error::WriteFile)
    }

    /// Touch every page of the mapping once so the kernel resolves page
    /// faults now rather than on the first real access from a latency
    /// sensitive caller.
    pub fn prefault(&mut self) {
        const PAGE: usize = 4096;
        let mut i = 0;
        while i < self.map.len() {
            self.map[i] = self.map[i];
            i += PAGE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.bin");
        {
            let mut m = MmapFile::create(&path, 4096).unwrap();
            m.as_mut_slice()[0..4].copy_from_slice(&[1, 2, 3, 4]);
            m.sync().unwrap();
        }
        let m = MmapFile::open(&path).unwrap();
        assert_eq!(m.len(), 4096);
        assert_eq!(&m.as_slice()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn range_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.bin");
        let m = MmapFile::create(&path, 128).unwrap();
        assert!(m.range(100, 28).is_ok());
        assert!(m.range(100, 29).is_err());
    }

    #[test]
    fn grow_extends_and_preserves_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.bin");
        let mut m = MmapFile::create(&path, 64).unwrap();
        m.as_mut_slice()[0] = 0xAB;
        m.grow(128).unwrap();
        assert_eq!(m.len(), 128);
        assert_eq!(m.as_slice()[0], 0xAB);
    }
}
