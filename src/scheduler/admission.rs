//! Per-connection admission and backpressure policy.
//!
//! Pure decision logic, evaluated with the connection lock held. The
//! dispatcher feeds it a snapshot of the connection and acts on the result.

use serde::{Deserialize, Serialize};

use crate::connection::{AuthInfo, ConnState, Connection};
use crate::protocol::RequestTag;

/// Tunable admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    /// Operations one connection may have executing at once
    /// (0 = half the worker pool, at least one).
    pub per_conn_max_executing: usize,
    /// Pending-queue ceiling for anonymous connections.
    pub max_pending: usize,
    /// Pending-queue ceiling for authenticated connections.
    pub max_pending_auth: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self { per_conn_max_executing: 0, max_pending: 100, max_pending_auth: 1000 }
    }
}

impl AdmissionLimits {
    /// Executing cap for a pool of `pool_capacity` threads.
    pub fn executing_cap(&self, pool_capacity: usize) -> usize {
        if self.per_conn_max_executing > 0 {
            self.per_conn_max_executing
        } else {
            (pool_capacity / 2).max(1)
        }
    }

    /// Pending-queue ceiling for a connection with this identity.
    pub fn ceiling(&self, auth: &AuthInfo) -> usize {
        if auth.is_authenticated() {
            self.max_pending_auth
        } else {
            self.max_pending
        }
    }
}

/// What admission looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionInput {
    pub state: ConnState,
    pub writewaiter: bool,
    pub executing: usize,
    pub pending: usize,
    pub tag: RequestTag,
}

impl AdmissionInput {
    pub fn of(conn: &Connection, tag: RequestTag) -> Self {
        Self {
            state: conn.state(),
            writewaiter: conn.is_writewaiter(),
            executing: conn.executing_len(),
            pending: conn.pending_len(),
            tag,
        }
    }
}

/// Why an operation was queued instead of dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeferReason {
    /// A response write is blocked on a slow client.
    AwaitingWrite,
    TooManyExecuting,
    /// A bind is in progress.
    Binding,
    /// Earlier requests are still queued.
    PendingOperations,
    /// Bind runs only as the sole executing operation.
    BindWaitsForIdle,
}

/// Admission outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Execute,
    Defer(DeferReason),
    /// Connection is closing; drop the request.
    Reject,
    /// Abandon, handled on the receiving thread.
    Abandon,
    /// Unbind, handled on the receiving thread.
    Unbind,
}

/// Decide what to do with a request of `input.tag`.
pub fn decide(input: &AdmissionInput, executing_cap: usize) -> Decision {
    if input.tag == RequestTag::Abandon {
        return Decision::Abandon;
    }
    match input.state {
        ConnState::Closing | ConnState::Invalid => return Decision::Reject,
        _ if input.tag == RequestTag::Unbind => return Decision::Unbind,
        ConnState::Client => return Decision::Execute,
        _ => {}
    }
    if input.writewaiter {
        return Decision::Defer(DeferReason::AwaitingWrite);
    }
    if input.executing >= executing_cap {
        return Decision::Defer(DeferReason::TooManyExecuting);
    }
    if input.state == ConnState::Binding {
        return Decision::Defer(DeferReason::Binding);
    }
    if input.pending > 0 {
        return Decision::Defer(DeferReason::PendingOperations);
    }
    if input.tag == RequestTag::Bind && input.executing > 0 {
        return Decision::Defer(DeferReason::BindWaitsForIdle);
    }
    Decision::Execute
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(state: ConnState, tag: RequestTag) -> AdmissionInput {
        AdmissionInput { state, writewaiter: false, executing: 0, pending: 0, tag }
    }

    #[test]
    fn test_idle_active_connection_executes() {
        assert_eq!(decide(&input(ConnState::Active, RequestTag::Search), 4), Decision::Execute);
        assert_eq!(decide(&input(ConnState::Inactive, RequestTag::Bind), 4), Decision::Execute);
    }

    #[test]
    fn test_abandon_bypasses_every_gate() {
        for state in [ConnState::Closing, ConnState::Binding, ConnState::Active] {
            let mut i = input(state, RequestTag::Abandon);
            i.writewaiter = true;
            i.pending = 3;
            assert_eq!(decide(&i, 1), Decision::Abandon);
        }
    }

    #[test]
    fn test_closing_rejects() {
        assert_eq!(decide(&input(ConnState::Closing, RequestTag::Search), 4), Decision::Reject);
        assert_eq!(decide(&input(ConnState::Closing, RequestTag::Unbind), 4), Decision::Reject);
    }

    #[test]
    fn test_gates_in_order() {
        let mut i = input(ConnState::Binding, RequestTag::Search);
        i.writewaiter = true;
        i.executing = 4;
        i.pending = 1;
        assert_eq!(decide(&i, 4), Decision::Defer(DeferReason::AwaitingWrite));
        i.writewaiter = false;
        assert_eq!(decide(&i, 4), Decision::Defer(DeferReason::TooManyExecuting));
        i.executing = 1;
        assert_eq!(decide(&i, 4), Decision::Defer(DeferReason::Binding));
        i.state = ConnState::Active;
        assert_eq!(decide(&i, 4), Decision::Defer(DeferReason::PendingOperations));
    }

    #[test]
    fn test_bind_waits_for_sole_execution() {
        let mut i = input(ConnState::Active, RequestTag::Bind);
        i.executing = 1;
        assert_eq!(decide(&i, 4), Decision::Defer(DeferReason::BindWaitsForIdle));
    }

    #[test]
    fn test_client_bypasses_limits() {
        let mut i = input(ConnState::Client, RequestTag::Modify);
        i.executing = 100;
        i.writewaiter = true;
        assert_eq!(decide(&i, 1), Decision::Execute);
    }

    #[test]
    fn test_cap_and_ceiling() {
        let limits = AdmissionLimits::default();
        assert_eq!(limits.executing_cap(8), 4);
        assert_eq!(limits.executing_cap(1), 1);
        let fixed = AdmissionLimits { per_conn_max_executing: 3, ..limits };
        assert_eq!(fixed.executing_cap(64), 3);

        assert_eq!(limits.ceiling(&AuthInfo::default()), 100);
        assert_eq!(limits.ceiling(&AuthInfo::simple("cn=admin", 3)), 1000);
    }
}
