//! Append-only log record addressing and framing constants.

/// `{ sig: u16, _pad: u16, byte_size: u32, crc32: u32, footprint: u32 }`,
/// 16 bytes total. `byte_size`/`crc32` describe the user payload; `footprint`
/// is the total on-disk span from this record's own offset to the next
/// record's offset (normally `align_up(RECORD_HEADER_LEN + byte_size)`, but
/// inflated to reach a segment boundary when the record that follows had to
/// roll into the next segment). `for_each` steps by `footprint`, not by
/// recomputing a size from `byte_size`, so it never has to guess where a
/// roll-induced gap ends.
pub const RECORD_HEADER_LEN: u32 = 16;
pub const RECORD_SIGNATURE: u16 = 0x656C; // "el"
pub(super) const FOOTPRINT_OFFSET: u32 = 12;

/// Absolute byte offset of a record within an [`super::AppendOnlyLog`]'s
/// backing file. Distinct from [`crate::far::FarAddr`]: the log is a single
/// growing file, not a collection of independently-addressed segments.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LogAddr(pub(super) u64);

impl LogAddr {
    pub fn raw(self) -> u64 {
        self.0
    }
}
