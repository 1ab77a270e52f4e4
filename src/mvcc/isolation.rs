//! Read isolation levels governing conflict behaviour for readonly requests.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ReadIsolation {
    /// Fail with a retryable conflict error when an overlapping write exists.
    Prevent = 0,
    /// Ignore overlapping uncommitted writes; see only committed state.
    ReadCommitted = 1,
    /// See overlapping uncommitted writes from other transactions.
    ReadUncommitted = 2,
}

impl ReadIsolation {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReadIsolation::Prevent,
            2 => ReadIsolation::ReadUncommitted,
            _ => ReadIsolation::ReadCommitted,
        }
    }
}

pub struct AtomicIsolation(AtomicU8);

impl AtomicIsolation {
    pub fn new(initial: ReadIsolation) -> Self {
        AtomicIsolation(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> ReadIsolation {
        ReadIsolation::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Atomically swap in `new`, returning the previous level.
    pub fn swap(&self, new: ReadIsolation) -> ReadIsolation {
        ReadIsolation::from_u8(self.0.swap(new as u8, Ordering::AcqRel))
    }
}

impl Default for AtomicIsolation {
    fn default() -> Self {
        AtomicIsolation::new(ReadIsolation::ReadCommitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_returns_previous() {
        let iso = AtomicIsolation::new(ReadIsolation::ReadCommitted);
        let prev = iso.swap(ReadIsolation::Prevent);
        assert_eq!(prev, ReadIsolation::ReadCommitted);
        assert_eq!(iso.load(), ReadIsolation::Prevent);
    }
}
