//! Storage transactions for operations.
//!
//! Read-only work reuses one snapshot per (worker thread, environment)
//! through the thread-local [`cache`]; write work always gets a fresh
//! transaction. [`OpTxns`] is the per-operation view over both.

mod binding;
pub mod cache;
mod memory;
mod storage;

pub use binding::{OpTxns, TxnKind};
pub use memory::{MemoryEnv, MemoryEnvStats};
pub use storage::{EnvId, ReadTxn, StorageEnv, StorageError, WriteTxn};
