use std::fmt;

/// Range in conflict, reported by [`Error::ConcurrentLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictInfo {
    pub requested_pos: u64,
    pub requested_len: u32,
    pub requesting_tid: u64,
    pub locked_pos: u64,
    pub locked_len: u32,
    pub locking_tid: u64,
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    FileOpen(std::io::Error),
    ReadFile(std::io::Error),
    WriteFile(std::io::Error),
    MemoryMapping(std::io::Error),
    InvalidSignature(&'static str),
    InvalidBlock(&'static str),
    OverlappingBlock,
    GhostState(&'static str),
    NoMemory,
    ConcurrentLock(ConflictInfo),
    RoTransactionActive,
    WriteTransactionActive,
    TransactionNotStarted,
    Corrupt(&'static str),
    PayloadTooLarge,
    InvalidFarAddress,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::FileOpen(e) => write!(f, "failed to open backing file: {e}"),
            Error::ReadFile(e) => write!(f, "failed to read backing file: {e}"),
            Error::WriteFile(e) => write!(f, "failed to write backing file: {e}"),
            Error::MemoryMapping(e) => write!(f, "failed to memory-map segment: {e}"),
            Error::InvalidSignature(what) => write!(f, "invalid signature: {what}"),
            Error::InvalidBlock(what) => write!(f, "invalid block: {what}"),
            Error::OverlappingBlock => write!(f, "overlapping non-identical lock request"),
            Error::GhostState(what) => write!(f, "operation on sealed transaction: {what}"),
            Error::NoMemory => write!(f, "no memory: all segments full and extension failed"),
            Error::ConcurrentLock(info) => write!(
                f,
                "concurrent lock: tid {} wants [{}, {}) but tid {} holds [{}, {})",
                info.requesting_tid,
                info.requested_pos,
                info.requested_pos + info.requested_len as u64,
                info.locking_tid,
                info.locked_pos,
                info.locked_pos + info.locked_len as u64,
            ),
            Error::RoTransactionActive => {
                write!(f, "cannot start a write transaction while a read-only transaction is active")
            }
            Error::WriteTransactionActive => {
                write!(f, "cannot start a read-only transaction while a write transaction is active")
            }
            Error::TransactionNotStarted => write!(f, "no active transaction on this thread"),
            Error::Corrupt(what) => write!(f, "corrupt data: {what}"),
            Error::PayloadTooLarge => write!(f, "payload exceeds segment capacity"),
            Error::InvalidFarAddress => write!(f, "far address out of range"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e)
            | Error::FileOpen(e)
            | Error::ReadFile(e)
            | Error::WriteFile(e)
            | Error::MemoryMapping(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// True when retrying the whole transaction later may succeed.
pub fn is_retryable(err: &Error) -> bool {
    matches!(err, Error::ConcurrentLock(_))
}
