//! Thread-local read-transaction cache.
//!
//! Each worker thread keeps at most one read snapshot per environment.
//! An operation takes a reference; when the count returns to zero the
//! snapshot is reset but stays installed, and the next operation on the
//! same thread renews it instead of opening a new one.
//!
//! Per (thread, environment) the slot is either empty (no map entry) or
//! cached with a reference count. Only the owning thread ever touches it.

use std::cell::RefCell;
use std::collections::HashMap;

use super::storage::{EnvId, ReadTxn, StorageEnv, StorageError};
use crate::telemetry::metrics;

struct CachedReader {
    txn: Box<dyn ReadTxn>,
    refs: u32,
}

#[derive(Default)]
struct ReaderCache {
    slots: HashMap<EnvId, CachedReader>,
}

impl Drop for ReaderCache {
    fn drop(&mut self) {
        for (_, reader) in self.slots.drain() {
            reader.txn.abort();
        }
    }
}

thread_local! {
    static READERS: RefCell<ReaderCache> = RefCell::new(ReaderCache::default());
}

/// How [`acquire`] satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// No cached reader; a new snapshot was opened and installed.
    Opened,
    /// An idle cached reader was renewed.
    Renewed,
    /// The cached reader was already referenced and is shared as is.
    Shared,
}

/// Observable state of this thread's reader for one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    pub handle_id: u64,
    pub snapshot: u64,
    pub refs: u32,
}

/// Take a reference on this thread's reader for `env`.
///
/// Renewal is tried before creation. A failed renewal evicts the entry so
/// a later call can install a fresh reader.
pub fn acquire(env: &dyn StorageEnv) -> Result<Acquired, StorageError> {
    let id = env.id();
    READERS.with(|cell| {
        let mut cache = cell.borrow_mut();
        let renewed = match cache.slots.get_mut(&id) {
            Some(entry) if entry.refs > 0 => {
                entry.refs += 1;
                return Ok(Acquired::Shared);
            }
            Some(entry) => Some(entry.txn.renew().map(|()| entry.refs = 1)),
            None => None,
        };

        match renewed {
            Some(Ok(())) => {
                metrics::record_reader(true);
                Ok(Acquired::Renewed)
            }
            Some(Err(e)) => {
                if let Some(dead) = cache.slots.remove(&id) {
                    dead.txn.abort();
                }
                tracing::warn!(env = id, error = %e, "cached reader evicted after failed renew");
                Err(e)
            }
            None => {
                let txn = env.begin_read()?;
                cache.slots.insert(id, CachedReader { txn, refs: 1 });
                metrics::record_reader(false);
                Ok(Acquired::Opened)
            }
        }
    })
}

/// Drop one reference. At zero the snapshot is reset and left installed.
pub fn release(env: EnvId) {
    let _ = READERS.try_with(|cell| {
        let mut cache = cell.borrow_mut();
        if let Some(entry) = cache.slots.get_mut(&env) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.txn.reset();
            }
        }
    });
}

/// Run `f` against this thread's reader for `env`, if one is installed.
pub fn with_reader<R>(env: EnvId, f: impl FnOnce(&dyn ReadTxn) -> R) -> Option<R> {
    READERS.with(|cell| {
        let cache = cell.borrow();
        cache.slots.get(&env).map(|entry| f(entry.txn.as_ref()))
    })
}

pub fn reader_info(env: EnvId) -> Option<ReaderInfo> {
    READERS.with(|cell| {
        cell.borrow().slots.get(&env).map(|e| ReaderInfo {
            handle_id: e.txn.handle_id(),
            snapshot: e.txn.snapshot(),
            refs: e.refs,
        })
    })
}

/// Abort this thread's reader for one environment.
pub fn flush_env(env: EnvId) -> bool {
    READERS
        .try_with(|cell| cell.borrow_mut().slots.remove(&env))
        .ok()
        .flatten()
        .map(|reader| reader.txn.abort())
        .is_some()
}

/// Abort every reader cached by this thread. Returns how many were closed.
pub fn flush_thread() -> usize {
    let drained: Vec<CachedReader> = READERS
        .try_with(|cell| cell.borrow_mut().slots.drain().map(|(_, r)| r).collect())
        .unwrap_or_default();
    let n = drained.len();
    for reader in drained {
        reader.txn.abort();
    }
    n
}
