//! Graceful shutdown coordination.
//!
//! A state machine for clean termination that drains in-flight operations
//! before the worker pool is joined. Every dispatched operation holds a
//! [`ShutdownGuard`]; draining waits for the guards to drop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

struct Drain {
    lock: Mutex<()>,
    cv: Condvar,
}

/// Coordinates graceful shutdown across the core.
pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    in_flight: Arc<AtomicU32>,
    drain: Arc<Drain>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ShutdownState::Running),
            in_flight: Arc::new(AtomicU32::new(0)),
            drain: Arc::new(Drain { lock: Mutex::new(()), cv: Condvar::new() }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.read()
    }

    /// Check if accepting new work.
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Track an in-flight operation. Returns `None` once shutdown began.
    pub fn track(&self) -> Option<ShutdownGuard> {
        let state = self.state.read();
        if *state != ShutdownState::Running {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ShutdownGuard { counter: self.in_flight.clone(), drain: self.drain.clone() })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting. Returns false if shutdown had already begun.
    pub fn begin(&self) -> bool {
        let mut state = self.state.write();
        if *state != ShutdownState::Running {
            return false;
        }
        *state = ShutdownState::Draining;
        true
    }

    /// Wait up to `timeout` for every guard to drop.
    pub fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = Instant::now() + timeout;
        let mut lock = self.drain.lock.lock();
        loop {
            let count = self.in_flight_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }
            if self.drain.cv.wait_until(&mut lock, deadline).timed_out() {
                let remaining = self.in_flight_count();
                if remaining == 0 {
                    return ShutdownResult::Complete;
                }
                return ShutdownResult::Timeout { remaining };
            }
        }
    }

    pub fn finish(&self) {
        *self.state.write() = ShutdownState::Stopped;
    }

    /// Stop accepting, wait for drain, and mark stopped.
    pub fn initiate(&self, timeout: Duration) -> ShutdownResult {
        self.begin();
        let result = self.wait_for_drain(timeout);
        self.finish();
        result
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for in-flight tracking.
pub struct ShutdownGuard {
    counter: Arc<AtomicU32>,
    drain: Arc<Drain>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        // Decrement under the drain lock so a waiter cannot miss the wakeup.
        let _lock = self.drain.lock.lock();
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.drain.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_refused_after_begin() {
        let coord = ShutdownCoordinator::new();
        let guard = coord.track().unwrap();
        assert_eq!(coord.in_flight_count(), 1);
        assert!(coord.begin());
        assert!(!coord.begin());
        assert!(coord.track().is_none());
        drop(guard);
        assert_eq!(coord.in_flight_count(), 0);
    }

    #[test]
    fn test_drain_completes_when_guard_drops() {
        let coord = Arc::new(ShutdownCoordinator::new());
        let guard = coord.track().unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
        });
        assert_eq!(coord.initiate(Duration::from_secs(5)), ShutdownResult::Complete);
        assert_eq!(coord.state(), ShutdownState::Stopped);
        releaser.join().unwrap();
    }

    #[test]
    fn test_drain_times_out() {
        let coord = ShutdownCoordinator::new();
        let _guard = coord.track().unwrap();
        let result = coord.initiate(Duration::from_millis(10));
        assert_eq!(result, ShutdownResult::Timeout { remaining: 1 });
    }
}
