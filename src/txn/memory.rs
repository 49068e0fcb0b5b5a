//! In-memory MVCC environment.
//!
//! Committed data is an immutable map behind an `Arc`; a reader pins one
//! version, renewal swaps in the latest. Writers are serialized by a single
//! writer lock held for the life of the write transaction. Used for tests,
//! benchmarks and embedded deployments without a disk backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use serde::Serialize;

use super::storage::{EnvId, ReadTxn, StorageEnv, StorageError, WriteTxn};

type Snapshot = Arc<BTreeMap<Vec<u8>, Vec<u8>>>;

/// Counters describing how the environment has been used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryEnvStats {
    pub readers_opened: u64,
    pub renewals: u64,
    pub resets: u64,
    pub reader_aborts: u64,
    pub writes_begun: u64,
    pub commits: u64,
    pub write_aborts: u64,
    pub version: u64,
}

#[derive(Default)]
struct Counters {
    readers_opened: AtomicU64,
    renewals: AtomicU64,
    resets: AtomicU64,
    reader_aborts: AtomicU64,
    writes_begun: AtomicU64,
    commits: AtomicU64,
    write_aborts: AtomicU64,
}

struct Shared {
    id: EnvId,
    current: RwLock<(u64, Snapshot)>,
    writer: Arc<Mutex<()>>,
    next_handle: AtomicU64,
    fail_begin: AtomicBool,
    fail_renew: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn latest(&self) -> (u64, Snapshot) {
        let current = self.current.read();
        (current.0, current.1.clone())
    }
}

/// Cloneable handle to an in-memory environment.
#[derive(Clone)]
pub struct MemoryEnv {
    shared: Arc<Shared>,
}

impl MemoryEnv {
    pub fn new(id: EnvId) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                current: RwLock::new((0, Arc::new(BTreeMap::new()))),
                writer: Arc::new(Mutex::new(())),
                next_handle: AtomicU64::new(1),
                fail_begin: AtomicBool::new(false),
                fail_renew: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Make the next `begin_read`/`begin_write` fail once.
    pub fn fail_next_begin(&self) {
        self.shared.fail_begin.store(true, Ordering::SeqCst);
    }

    /// Make the next `renew` fail once.
    pub fn fail_next_renew(&self) {
        self.shared.fail_renew.store(true, Ordering::SeqCst);
    }

    /// Latest committed version.
    pub fn version(&self) -> u64 {
        self.shared.current.read().0
    }

    pub fn stats(&self) -> MemoryEnvStats {
        let c = &self.shared.counters;
        MemoryEnvStats {
            readers_opened: c.readers_opened.load(Ordering::Relaxed),
            renewals: c.renewals.load(Ordering::Relaxed),
            resets: c.resets.load(Ordering::Relaxed),
            reader_aborts: c.reader_aborts.load(Ordering::Relaxed),
            writes_begun: c.writes_begun.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            write_aborts: c.write_aborts.load(Ordering::Relaxed),
            version: self.version(),
        }
    }

    fn take_begin_failure(&self) -> Result<(), StorageError> {
        if self.shared.fail_begin.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Begin(format!("environment {} unavailable", self.shared.id)));
        }
        Ok(())
    }
}

impl StorageEnv for MemoryEnv {
    fn id(&self) -> EnvId {
        self.shared.id
    }

    fn begin_read(&self) -> Result<Box<dyn ReadTxn>, StorageError> {
        self.take_begin_failure()?;
        let (version, data) = self.shared.latest();
        self.shared.counters.readers_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemReader {
            shared: self.shared.clone(),
            handle: self.shared.next_handle.fetch_add(1, Ordering::Relaxed),
            version,
            data: Some(data),
        }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn>, StorageError> {
        self.take_begin_failure()?;
        let guard = self.shared.writer.lock_arc();
        let (_, data) = self.shared.latest();
        self.shared.counters.writes_begun.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemWriter {
            shared: self.shared.clone(),
            working: (*data).clone(),
            _writer: guard,
        }))
    }
}

struct MemReader {
    shared: Arc<Shared>,
    handle: u64,
    version: u64,
    data: Option<Snapshot>,
}

impl ReadTxn for MemReader {
    fn handle_id(&self) -> u64 {
        self.handle
    }

    fn snapshot(&self) -> u64 {
        self.version
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.as_ref()?.get(key).cloned()
    }

    fn renew(&mut self) -> Result<(), StorageError> {
        if self.shared.fail_renew.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Renew(format!("reader {} invalidated", self.handle)));
        }
        let (version, data) = self.shared.latest();
        self.version = version;
        self.data = Some(data);
        self.shared.counters.renewals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reset(&mut self) {
        self.data = None;
        self.shared.counters.resets.fetch_add(1, Ordering::Relaxed);
    }

    fn abort(self: Box<Self>) {
        self.shared.counters.reader_aborts.fetch_add(1, Ordering::Relaxed);
    }
}

struct MemWriter {
    shared: Arc<Shared>,
    working: BTreeMap<Vec<u8>, Vec<u8>>,
    _writer: ArcMutexGuard<RawMutex, ()>,
}

impl WriteTxn for MemWriter {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.working.get(key).cloned()
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.working.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.working.remove(key).is_some())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemWriter { shared, working, _writer } = *self;
        {
            let mut current = shared.current.write();
            current.0 += 1;
            current.1 = Arc::new(working);
        }
        shared.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        self.shared.counters.write_aborts.fetch_add(1, Ordering::Relaxed);
    }
}
