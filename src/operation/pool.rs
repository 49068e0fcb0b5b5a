//! Operation pooling for allocation-free reuse on the request path.
//!
//! Uses a parking_lot mutex over a free list of bodies. Only bodies are
//! pooled; each acquire stamps a fresh header.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use super::{OpBody, OpHeader, Operation};
use crate::protocol::Pdu;
use crate::telemetry::metrics;

/// Configuration for the operation pool.
#[derive(Debug, Clone)]
pub struct OpPoolConfig {
    /// Bodies kept on the free list; extra releases are dropped.
    pub max_free: usize,
    /// Byte capacity of each operation's arena.
    pub arena_capacity: usize,
}

impl Default for OpPoolConfig {
    fn default() -> Self {
        Self { max_free: 1024, arena_capacity: 16 * 1024 }
    }
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpPoolStats {
    pub allocated: u64,
    pub reused: u64,
    pub released: u64,
    pub dropped: u64,
    pub free: usize,
}

#[derive(Debug, Default)]
struct TickClock {
    second: i64,
    tick: u32,
}

/// Global free list of operation bodies.
pub struct OperationPool {
    free: Mutex<Vec<OpBody>>,
    clock: Mutex<TickClock>,
    config: OpPoolConfig,
    shutting_down: AtomicBool,
    allocated: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
    dropped: AtomicU64,
}

impl OperationPool {
    pub fn new(config: OpPoolConfig) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(config.max_free.min(1024))),
            clock: Mutex::new(TickClock::default()),
            config,
            shutting_down: AtomicBool::new(false),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            released: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Issue an operation for a decoded request.
    ///
    /// Pops a recycled body if one is available, otherwise allocates.
    pub fn acquire(&self, connid: u64, opid: u64, pdu: Pdu) -> Operation {
        let recycled = self.free.lock().pop();
        let mut body = match recycled {
            Some(body) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                body
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                OpBody::new(self.config.arena_capacity)
            }
        };

        if body.value.capacity() >= pdu.value.len() {
            body.value.extend_from_slice(&pdu.value);
        } else {
            body.value = pdu.value;
        }
        body.controls.extend(pdu.controls);

        let started = Utc::now();
        let tick = {
            let mut clock = self.clock.lock();
            let second = started.timestamp();
            if clock.second == second {
                clock.tick += 1;
            } else {
                clock.second = second;
                clock.tick = 0;
            }
            clock.tick
        };

        let header = OpHeader {
            connid,
            opid,
            msgid: pdu.msgid,
            tag: pdu.tag,
            started,
            started_at: Instant::now(),
            tick,
        };
        Operation::new(header, body)
    }

    /// Return an operation's body to the free list.
    ///
    /// The body is dropped instead while shutting down or when the free
    /// list is full.
    pub fn release(&self, op: Operation) {
        let mut body = op.body;
        if self.shutting_down.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        body.reset();
        let mut free = self.free.lock();
        if free.len() >= self.config.max_free {
            drop(free);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        free.push(body);
        let len = free.len();
        drop(free);
        self.released.fetch_add(1, Ordering::Relaxed);
        metrics::record_op_pool(len);
    }

    /// Stop recycling and free every pooled body.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.free.lock());
        tracing::debug!(freed = drained.len(), "operation pool drained");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Current number of recycled bodies.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> OpPoolStats {
        OpPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            free: self.available(),
        }
    }
}

impl Default for OperationPool {
    fn default() -> Self {
        Self::new(OpPoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestTag;

    #[test]
    fn test_empty_pool_allocates() {
        let pool = OperationPool::default();
        let op = pool.acquire(1, 1, Pdu::new(1, RequestTag::Search, b"x".to_vec()));
        assert_eq!(op.request_value(), b"x");
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().reused, 0);
    }

    #[test]
    fn test_tick_increments_within_a_second() {
        let pool = OperationPool::default();
        let a = pool.acquire(1, 1, Pdu::new(1, RequestTag::Search, vec![]));
        let b = pool.acquire(1, 2, Pdu::new(2, RequestTag::Search, vec![]));
        if a.header.started.timestamp() == b.header.started.timestamp() {
            assert_eq!(b.header.tick, a.header.tick + 1);
        } else {
            assert_eq!(b.header.tick, 0);
        }
    }

    #[test]
    fn test_free_list_ceiling() {
        let pool = OperationPool::new(OpPoolConfig { max_free: 1, arena_capacity: 0 });
        let a = pool.acquire(1, 1, Pdu::new(1, RequestTag::Search, vec![]));
        let b = pool.acquire(1, 2, Pdu::new(2, RequestTag::Search, vec![]));
        pool.release(a);
        pool.release(b);
        let stats = pool.stats();
        assert_eq!(stats.free, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.dropped, 1);
    }
}
