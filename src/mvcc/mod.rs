//! MVCC core: read isolation levels, shadow buffers and the change-history
//! conflict detector that backs every transactional read and write.

pub mod history;
pub mod isolation;
pub mod shadow;
pub mod transaction;

pub use history::MemoryChangeHistory;
pub use isolation::ReadIsolation;
pub use shadow::{MemoryRequestType, ShadowBuffer};
pub use transaction::{EndOfTransactionListener, PendingWrite, Transaction, TxnHandle};
