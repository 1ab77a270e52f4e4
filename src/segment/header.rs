//! On-disk segment header, written once per segment at offset 0.

use crate::error::{Error, Result};
use crate::far::ALIGN;

pub const SEGMENT_SIGNATURE: u32 = 0xDEAD_F00D;

/// First `ALIGN`-aligned bytes of every segment.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SegmentHeader {
    pub signature: u32,
    pub segment_size: u32,
}

pub const SEGMENT_HEADER_LEN: usize = ALIGN as usize;

impl SegmentHeader {
    pub fn new(segment_size: u32) -> Self {
        SegmentHeader {
            signature: SEGMENT_SIGNATURE,
            segment_size,
        }
    }

    pub fn to_bytes(self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.signature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.segment_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SEGMENT_HEADER_LEN {
            return Err(Error::Corrupt("segment header truncated"));
        }
        let signature = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let segment_size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if signature != SEGMENT_SIGNATURE {
            return Err(Error::InvalidSignature("segment header"));
        }
        Ok(SegmentHeader {
            signature,
            segment_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = SegmentHeader::new(65536);
        let bytes = h.to_bytes();
        let back = SegmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.signature, SEGMENT_SIGNATURE);
        assert_eq!(back.segment_size, 65536);
    }

    #[test]
    fn bad_signature_rejected() {
        let mut bytes = SegmentHeader::new(4096).to_bytes();
        bytes[0] = 0;
        assert!(SegmentHeader::from_bytes(&bytes).is_err());
    }
}
