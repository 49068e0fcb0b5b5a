//! Storage-engine seam.
//!
//! The engine is an MVCC store with cheap snapshot renewal and a single
//! writer. Backend selection and the engine itself live outside the core.

use thiserror::Error;

/// Identifies one storage environment (one database file / backend).
pub type EnvId = u64;

/// Errors surfaced by the storage engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("failed to begin transaction: {0}")]
    Begin(String),
    #[error("failed to renew read snapshot: {0}")]
    Renew(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("no transaction bound for environment {0}")]
    NotBound(EnvId),
    #[error("transaction for environment {0} is read-only")]
    ReadOnly(EnvId),
}

/// A storage environment able to start transactions.
pub trait StorageEnv: Send + Sync {
    fn id(&self) -> EnvId;

    /// Open a new read snapshot. Expensive relative to [`ReadTxn::renew`].
    fn begin_read(&self) -> Result<Box<dyn ReadTxn>, StorageError>;

    /// Start a write transaction. May block while another writer is active.
    fn begin_write(&self) -> Result<Box<dyn WriteTxn>, StorageError>;
}

/// A read snapshot. Owned by one thread for its whole life.
pub trait ReadTxn {
    /// Stable identity of the underlying reader handle; survives renewal.
    fn handle_id(&self) -> u64;

    /// Version of the data this snapshot currently sees.
    fn snapshot(&self) -> u64;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Refresh to the latest committed version without reopening.
    fn renew(&mut self) -> Result<(), StorageError>;

    /// Release the snapshot's pin on old versions but keep the handle.
    fn reset(&mut self);

    fn abort(self: Box<Self>);
}

/// A write transaction. Aborted unless committed.
pub trait WriteTxn {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&mut self, key: &[u8]) -> Result<bool, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    fn abort(self: Box<Self>);
}
