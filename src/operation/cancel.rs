//! Cooperative cancellation shared between a connection and its operation.
//!
//! Abandon only raises a flag. Cancel additionally runs a small handshake
//! with the worker so the canceller can report whether the operation was
//! actually stopped:
//!
//! ```text
//! None --request--> Requested --worker--> Acked | TooLate --canceller--> Done
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Cancel handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelState {
    None = 0,
    Requested = 1,
    Acked = 2,
    TooLate = 3,
    Done = 4,
}

impl CancelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CancelState::Requested,
            2 => CancelState::Acked,
            3 => CancelState::TooLate,
            4 => CancelState::Done,
            _ => CancelState::None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    abandoned: AtomicBool,
    state: AtomicU8,
}

/// Shared abandon flag and cancel state. Cloning shares the token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the operation to stop at its next yield point.
    pub fn abandon(&self) {
        self.inner.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.inner.abandoned.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CancelState {
        CancelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Start a cancel: `None -> Requested`, raising the abandon flag.
    ///
    /// Fails with the current state if a cancel is already underway.
    pub fn request_cancel(&self) -> Result<(), CancelState> {
        self.inner
            .state
            .compare_exchange(
                CancelState::None as u8,
                CancelState::Requested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(CancelState::from_u8)?;
        self.abandon();
        Ok(())
    }

    /// Worker side: answer a pending request. `stopped` tells whether the
    /// handler gave up because of the abandon flag.
    pub fn resolve(&self, stopped: bool) -> CancelState {
        let answer = if stopped { CancelState::Acked } else { CancelState::TooLate };
        match self.inner.state.compare_exchange(
            CancelState::Requested as u8,
            answer as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => answer,
            Err(current) => CancelState::from_u8(current),
        }
    }

    /// Canceller side: wait for the worker's answer.
    pub fn wait_resolved(&self) -> CancelState {
        loop {
            match self.state() {
                CancelState::Requested => std::thread::yield_now(),
                other => return other,
            }
        }
    }

    /// Canceller side: close the handshake.
    pub fn finish(&self) {
        self.inner.state.store(CancelState::Done as u8, Ordering::Release);
    }

    /// Worker side: yield until the canceller closes the handshake.
    pub fn settle(&self) {
        while matches!(
            self.state(),
            CancelState::Requested | CancelState::Acked | CancelState::TooLate
        ) {
            std::thread::yield_now();
        }
    }
}
