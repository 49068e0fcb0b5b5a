//! Per-operation transaction bindings.
//!
//! An [`OpTxns`] lives on the worker's stack for the duration of one
//! operation. Read bindings point at the thread's cached reader; write
//! bindings own a fresh write transaction. Every successful `bind` must be
//! paired with a `release` or `commit`; whatever is left when the
//! operation ends is released by `release_all` (writes are aborted).

use std::marker::PhantomData;

use super::cache;
use super::storage::{EnvId, StorageEnv, StorageError, WriteTxn};

/// Kind of transaction an operation holds for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Read,
    Write,
}

enum Binding {
    Read { depth: u32 },
    Write { txn: Box<dyn WriteTxn>, depth: u32 },
}

/// Transactions bound to one running operation.
///
/// Not `Send`: read bindings refer to the current thread's reader cache.
pub struct OpTxns {
    bindings: Vec<(EnvId, Binding)>,
    _thread: PhantomData<*const ()>,
}

impl Default for OpTxns {
    fn default() -> Self {
        Self::new()
    }
}

impl OpTxns {
    pub fn new() -> Self {
        Self { bindings: Vec::new(), _thread: PhantomData }
    }

    fn position(&self, env: EnvId) -> Option<usize> {
        self.bindings.iter().position(|(id, _)| *id == env)
    }

    /// Bind `env` for reading or writing.
    ///
    /// An existing binding is reused; a write binding also serves reads.
    /// A read binding asked for write access is upgraded to a new write
    /// transaction and its cached-reader reference is given back.
    pub fn bind(&mut self, env: &dyn StorageEnv, read_only: bool) -> Result<TxnKind, StorageError> {
        let id = env.id();
        let Some(i) = self.position(id) else {
            let binding = if read_only {
                cache::acquire(env)?;
                Binding::Read { depth: 1 }
            } else {
                Binding::Write { txn: env.begin_write()?, depth: 1 }
            };
            let kind = binding_kind(&binding);
            self.bindings.push((id, binding));
            return Ok(kind);
        };

        match &mut self.bindings[i].1 {
            Binding::Read { depth } if read_only => {
                *depth += 1;
                Ok(TxnKind::Read)
            }
            Binding::Write { depth, .. } => {
                *depth += 1;
                Ok(TxnKind::Write)
            }
            Binding::Read { depth } => {
                let depth = *depth + 1;
                let txn = env.begin_write()?;
                cache::release(id);
                tracing::debug!(env = id, "read binding upgraded to write");
                self.bindings[i].1 = Binding::Write { txn, depth };
                Ok(TxnKind::Write)
            }
        }
    }

    pub fn kind(&self, env: EnvId) -> Option<TxnKind> {
        self.position(env).map(|i| binding_kind(&self.bindings[i].1))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Read a key through whatever transaction is bound for `env`.
    pub fn get(&self, env: EnvId, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let i = self.position(env).ok_or(StorageError::NotBound(env))?;
        match &self.bindings[i].1 {
            Binding::Read { .. } => {
                cache::with_reader(env, |txn| txn.get(key)).ok_or(StorageError::NotBound(env))
            }
            Binding::Write { txn, .. } => Ok(txn.get(key)),
        }
    }

    /// Handle id of the cached reader backing a read binding.
    pub fn reader_handle(&self, env: EnvId) -> Option<u64> {
        match self.kind(env)? {
            TxnKind::Read => cache::with_reader(env, |txn| txn.handle_id()),
            TxnKind::Write => None,
        }
    }

    /// Mutable access to a bound write transaction.
    pub fn write_txn(&mut self, env: EnvId) -> Result<&mut dyn WriteTxn, StorageError> {
        let i = self.position(env).ok_or(StorageError::NotBound(env))?;
        match &mut self.bindings[i].1 {
            Binding::Write { txn, .. } => Ok(txn.as_mut()),
            Binding::Read { .. } => Err(StorageError::ReadOnly(env)),
        }
    }

    pub fn put(&mut self, env: EnvId, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.write_txn(env)?.put(key, value)
    }

    pub fn delete(&mut self, env: EnvId, key: &[u8]) -> Result<bool, StorageError> {
        self.write_txn(env)?.delete(key)
    }

    /// Commit the write binding for `env` once its outermost bind is done.
    pub fn commit(&mut self, env: EnvId) -> Result<(), StorageError> {
        let i = self.position(env).ok_or(StorageError::NotBound(env))?;
        match &mut self.bindings[i].1 {
            Binding::Read { .. } => Err(StorageError::ReadOnly(env)),
            Binding::Write { depth, .. } if *depth > 1 => {
                *depth -= 1;
                Ok(())
            }
            Binding::Write { .. } => match self.bindings.swap_remove(i).1 {
                Binding::Write { txn, .. } => txn.commit(),
                Binding::Read { .. } => Ok(()),
            },
        }
    }

    /// Undo one `bind`. The last release drops the binding: readers give
    /// their reference back to the thread cache, writers abort.
    pub fn release(&mut self, env: EnvId) {
        let Some(i) = self.position(env) else { return };
        let last = match &mut self.bindings[i].1 {
            Binding::Read { depth } | Binding::Write { depth, .. } => {
                *depth = depth.saturating_sub(1);
                *depth == 0
            }
        };
        if last {
            let (id, binding) = self.bindings.swap_remove(i);
            drop_binding(id, binding);
        }
    }

    /// Release every binding regardless of depth.
    pub fn release_all(&mut self) {
        for (id, binding) in self.bindings.drain(..) {
            drop_binding(id, binding);
        }
    }
}

impl Drop for OpTxns {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn binding_kind(binding: &Binding) -> TxnKind {
    match binding {
        Binding::Read { .. } => TxnKind::Read,
        Binding::Write { .. } => TxnKind::Write,
    }
}

fn drop_binding(env: EnvId, binding: Binding) {
    match binding {
        Binding::Read { .. } => cache::release(env),
        Binding::Write { txn, .. } => {
            tracing::debug!(env, "uncommitted write transaction aborted");
            txn.abort();
        }
    }
}
