//! A memory-mapped, transactional storage core: fixed-size segment files
//! addressed by far pointers, a heap and fixed-size pool allocator layered
//! on top, an append-only indexed log, and an MVCC transaction engine tying
//! it all together.
//!
//! The top-level entry point is [`engine::EventSourcingSegmentManager`].

pub mod engine;
pub mod error;
pub mod far;
pub mod log;
pub mod mmap;
pub mod mvcc;
pub mod segment;
pub mod skiplist;
pub mod threadpool;
pub mod topology;
pub mod wait;

pub use engine::{EngineConfig, EventSourcingSegmentManager, ReadonlyChunk, RoTransactionGuard, WritableChunk};
pub use error::{Error, Result};
pub use far::{ByteRange, FarAddr};
pub use mvcc::{EndOfTransactionListener, MemoryRequestType, ReadIsolation, TxnHandle};
