//! Fixed-capacity connection table.
//!
//! Slots are addressed by [`ConnKey`] (index plus generation) and found by
//! transport handle through a map. Two lock levels exist: the table mutex
//! guards slot identity and allocation, each connection's mutex guards its
//! fields. The order is always table first, then connection. Every place
//! that needs both goes through [`ConnectionTable::lookup`],
//! [`ConnectionTable::relock`] or [`ConnectionTable::try_finalize_close`].

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{ArcMutexGuard, Condvar, Mutex, RawMutex};
use serde::Serialize;

use super::conn::{Connection, ConnectionInfo};
use super::state::{AuthInfo, ConnState, StructState};
use crate::error::CoreError;
use crate::operation::Operation;
use crate::protocol::TransportHandle;
use crate::telemetry::{connection_span, metrics};
use crate::transport::{PeerInfo, SecurityFactors, Transport};

/// Configuration for the connection table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub max_connections: usize,
    /// Connections idle this long are closed by the sweep. `None` disables.
    pub idle_timeout: Option<Duration>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self { max_connections: 1024, idle_timeout: None }
    }
}

/// Stable address of a connection slot. A key outlives the connection it
/// named; the generation makes such stale keys detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnKey {
    pub index: u32,
    pub generation: u32,
}

/// Write-side synchronization, kept outside the connection mutex so a
/// blocked writer can wait on it.
#[derive(Default)]
pub(crate) struct ConnIo {
    /// Serializes whole-PDU writes.
    pub(crate) write_lock: Mutex<()>,
    /// Signalled when the transport becomes writable or the connection closes.
    pub(crate) write_cv: Condvar,
}

/// Shared reference to one connection.
#[derive(Clone)]
pub struct ConnHandle {
    key: ConnKey,
    id: u64,
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) io: Arc<ConnIo>,
}

impl ConnHandle {
    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle").field("key", &self.key).field("id", &self.id).finish()
    }
}

/// A connection locked through the table. Dereferences to [`Connection`].
pub struct LockedConn {
    handle: ConnHandle,
    guard: ArcMutexGuard<RawMutex, Connection>,
}

impl LockedConn {
    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    /// Release the connection lock, keeping the handle.
    pub fn unlock(self) -> ConnHandle {
        let LockedConn { handle, guard } = self;
        drop(guard);
        handle
    }

    /// Move to `Closing` and wake any blocked writer. Returns the discarded
    /// queued operations, which the caller must give back to the pool.
    pub(crate) fn mark_closing(&mut self, reason: &str) -> Vec<Operation> {
        let discarded = self.guard.mark_closing(reason);
        self.handle.io.write_cv.notify_all();
        discarded
    }
}

impl Deref for LockedConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl DerefMut for LockedConn {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.guard
    }
}

struct Slot {
    state: StructState,
    generation: u32,
    handle: Option<ConnHandle>,
}

struct TableInner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_handle: HashMap<TransportHandle, usize>,
    in_use: usize,
}

impl TableInner {
    fn live(&self, key: ConnKey) -> Option<&ConnHandle> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.state != StructState::Used || slot.generation != key.generation {
            return None;
        }
        slot.handle.as_ref()
    }
}

/// Registry of all connections.
pub struct ConnectionTable {
    inner: Mutex<TableInner>,
    config: TableConfig,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new(config: TableConfig) -> Self {
        let capacity = config.max_connections.max(1);
        let slots = (0..capacity)
            .map(|_| Slot { state: StructState::Uninitialized, generation: 0, handle: None })
            .collect();
        // Reversed so the lowest index is handed out first.
        let free = (0..capacity).rev().collect();
        Self {
            inner: Mutex::new(TableInner {
                slots,
                free,
                by_handle: HashMap::with_capacity(capacity),
                in_use: 0,
            }),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().in_use
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Register a network connection in the `Inactive` state.
    pub fn create(
        &self,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
        security: SecurityFactors,
    ) -> Result<ConnHandle, CoreError> {
        let auth = AuthInfo { ssf: security, ..AuthInfo::default() };
        self.insert(transport, peer, auth, ConnState::Inactive)
    }

    /// Register an in-process client connection, already authenticated
    /// as `auth`.
    pub fn create_client(
        &self,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
        auth: AuthInfo,
    ) -> Result<ConnHandle, CoreError> {
        self.insert(transport, peer, auth, ConnState::Client)
    }

    fn insert(
        &self,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
        auth: AuthInfo,
        state: ConnState,
    ) -> Result<ConnHandle, CoreError> {
        let th = transport.handle();
        let mut inner = self.inner.lock();
        if inner.by_handle.contains_key(&th) {
            metrics::record_connection_rejected("duplicate");
            return Err(CoreError::DuplicateHandle(th));
        }
        let Some(index) = inner.free.pop() else {
            let capacity = inner.slots.len();
            drop(inner);
            metrics::record_connection_rejected("table_full");
            tracing::warn!(handle = th, capacity, "connection table full");
            return Err(CoreError::TableFull { capacity });
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = connection_span(id, &peer.peer);
        let slot = &mut inner.slots[index];
        let key = ConnKey { index: index as u32, generation: slot.generation };
        let conn = Connection::new(id, key, state, transport, peer, auth);
        let handle = ConnHandle {
            key,
            id,
            conn: Arc::new(Mutex::new(conn)),
            io: Arc::new(ConnIo::default()),
        };
        slot.state = StructState::Used;
        slot.handle = Some(handle.clone());
        inner.by_handle.insert(th, index);
        inner.in_use += 1;
        let current = inner.in_use;
        drop(inner);

        metrics::record_connection_accepted(current);
        span.in_scope(|| tracing::info!(handle = th, ?key, current, "connection registered"));
        Ok(handle)
    }

    /// Locate the connection for a transport handle and lock it.
    ///
    /// The table lock is held only until the connection lock is taken.
    pub fn lookup(&self, th: TransportHandle) -> Result<LockedConn, CoreError> {
        let inner = self.inner.lock();
        let index = *inner.by_handle.get(&th).ok_or(CoreError::UnknownHandle(th))?;
        let handle = inner.slots[index].handle.clone().ok_or(CoreError::UnknownHandle(th))?;
        let guard = handle.conn.lock_arc();
        drop(inner);
        Ok(LockedConn { handle, guard })
    }

    /// Lock the connection named by `key`.
    pub fn lock(&self, key: ConnKey) -> Result<LockedConn, CoreError> {
        let inner = self.inner.lock();
        let handle = inner.live(key).cloned().ok_or(CoreError::StaleKey)?;
        let guard = handle.conn.lock_arc();
        drop(inner);
        Ok(LockedConn { handle, guard })
    }

    /// Re-lock a connection through the table, in table-then-connection
    /// order. Fails if the connection was freed meanwhile.
    pub fn relock(&self, handle: &ConnHandle) -> Result<LockedConn, CoreError> {
        let inner = self.inner.lock();
        let same = inner.live(handle.key).is_some_and(|h| Arc::ptr_eq(&h.conn, &handle.conn));
        if !same {
            return Err(CoreError::StaleKey);
        }
        let guard = handle.conn.lock_arc();
        drop(inner);
        Ok(LockedConn { handle: handle.clone(), guard })
    }

    /// Free the slot of a closing connection with nothing outstanding.
    ///
    /// Called with only the connection locked. If the table lock is not
    /// immediately available the connection is unlocked, the table locked,
    /// the connection relocked, and the state checked again, so the lock
    /// order is never inverted. Returns the still-locked connection when it
    /// could not be freed, `None` when it is gone.
    pub fn try_finalize_close(&self, conn: LockedConn) -> Option<LockedConn> {
        if !conn.ready_to_free() {
            return Some(conn);
        }
        let (mut inner, mut conn) = match self.inner.try_lock() {
            Some(inner) => (inner, conn),
            None => {
                let handle = conn.unlock();
                let inner = self.inner.lock();
                let guard = handle.conn.lock_arc();
                (inner, LockedConn { handle, guard })
            }
        };
        if conn.state == ConnState::Invalid {
            return None;
        }
        if !conn.ready_to_free() {
            drop(inner);
            return Some(conn);
        }

        let key = conn.key;
        let th = conn.transport.handle();
        let transport = conn.transport.clone();
        conn.state = ConnState::Invalid;
        if let Some(slot) = inner.slots.get_mut(key.index as usize) {
            slot.state = StructState::Unused;
            slot.generation = slot.generation.wrapping_add(1);
            slot.handle = None;
        }
        if inner.by_handle.get(&th) == Some(&(key.index as usize)) {
            inner.by_handle.remove(&th);
        }
        inner.free.push(key.index as usize);
        inner.in_use -= 1;
        let current = inner.in_use;
        let id = conn.id;
        let counters = conn.counters.clone();
        drop(conn);
        drop(inner);

        transport.close();
        metrics::record_connection_closed(current);
        tracing::info!(
            conn = id,
            handle = th,
            received = counters.received,
            completed = counters.completed,
            "connection closed"
        );
        None
    }

    /// Handles of every live connection.
    pub fn handles(&self) -> Vec<ConnHandle> {
        let inner = self.inner.lock();
        inner.slots.iter().filter_map(|s| s.handle.clone()).collect()
    }

    /// Snapshot of every live connection, in slot order.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter_map(|s| s.handle.as_ref())
            .map(|h| h.conn.lock().info())
            .collect()
    }

    /// Slot-level state, for diagnostics.
    pub fn slot_state(&self, index: usize) -> Option<StructState> {
        self.inner.lock().slots.get(index).map(|s| s.state)
    }

    /// Close connections idle past the configured timeout and free closing
    /// connections with nothing outstanding. Connections with queued,
    /// running or persistent operations are never touched.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let timeout = self.config.idle_timeout;
        let mut freed = 0;
        for handle in self.handles() {
            let Ok(mut conn) = self.relock(&handle) else { continue };
            let expired = timeout.is_some_and(|t| conn.idle_expired(now, t));
            if expired {
                tracing::info!(conn = conn.id, "closing idle connection");
                // Quiescent, so nothing is discarded.
                let _ = conn.mark_closing("idle timeout");
            }
            if conn.ready_to_free() && self.try_finalize_close(conn).is_none() {
                freed += 1;
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicBool;

    struct NullTransport {
        handle: TransportHandle,
        closed: AtomicBool,
    }

    impl NullTransport {
        fn new(handle: TransportHandle) -> Arc<Self> {
            Arc::new(Self { handle, closed: AtomicBool::new(false) })
        }
    }

    impl Transport for NullTransport {
        fn handle(&self) -> TransportHandle {
            self.handle
        }
        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn stop_reading(&self) {}
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn table(capacity: usize) -> ConnectionTable {
        ConnectionTable::new(TableConfig { max_connections: capacity, idle_timeout: None })
    }

    #[test]
    fn test_lowest_slot_first_and_ids_increase() {
        let t = table(4);
        let a = t.create(NullTransport::new(10), PeerInfo::default(), SecurityFactors::default()).unwrap();
        let b = t.create(NullTransport::new(11), PeerInfo::default(), SecurityFactors::default()).unwrap();
        assert_eq!(a.key().index, 0);
        assert_eq!(b.key().index, 1);
        assert!(b.id() > a.id());
        assert_eq!(t.slot_state(0), Some(StructState::Used));
        assert_eq!(t.slot_state(2), Some(StructState::Uninitialized));
    }

    #[test]
    fn test_finalize_requires_closing() {
        let t = table(2);
        let transport = NullTransport::new(7);
        t.create(transport.clone(), PeerInfo::default(), SecurityFactors::default()).unwrap();

        let conn = t.lookup(7).unwrap();
        let conn = t.try_finalize_close(conn).expect("active connection stays");
        assert_eq!(conn.state(), ConnState::Inactive);
        drop(conn);

        let mut conn = t.lookup(7).unwrap();
        assert!(conn.mark_closing("test").is_empty());
        assert!(t.try_finalize_close(conn).is_none());
        assert!(transport.closed.load(Ordering::SeqCst));
        assert_eq!(t.slot_state(0), Some(StructState::Unused));
        assert!(matches!(t.lookup(7), Err(CoreError::UnknownHandle(7))));
    }

    #[test]
    fn test_finalize_waits_for_table_lock() {
        let t = Arc::new(table(2));
        t.create(NullTransport::new(3), PeerInfo::default(), SecurityFactors::default()).unwrap();
        let locked = Arc::new(std::sync::Barrier::new(2));
        let table_held = Arc::new(std::sync::Barrier::new(2));

        let finisher = {
            let (t, locked, table_held) = (t.clone(), locked.clone(), table_held.clone());
            std::thread::spawn(move || {
                let mut conn = t.lookup(3).unwrap();
                conn.mark_closing("test");
                locked.wait();
                table_held.wait();
                t.try_finalize_close(conn).is_none()
            })
        };

        locked.wait();
        let held = t.inner.lock();
        table_held.wait();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(held.in_use, 1);
        drop(held);
        assert!(finisher.join().unwrap());
        assert!(t.is_empty());
    }
}
