//! Per-connection mutable state.
//!
//! Every field here is guarded by the connection's own mutex. The queue
//! bookkeeping keeps `executing.len() + pending.len() == admitted - completed`
//! true whenever the lock is released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::{AuthInfo, ConnState};
use super::table::ConnKey;
use crate::operation::{CancelToken, Operation};
use crate::protocol::{MessageId, RequestTag, TransportHandle};
use crate::transport::{PeerInfo, Transport};

/// Connection-side record of a running operation.
#[derive(Debug, Clone)]
pub struct ExecutingOp {
    pub opid: u64,
    pub msgid: MessageId,
    pub tag: RequestTag,
    pub cancel: CancelToken,
}

impl ExecutingOp {
    pub(crate) fn of(op: &Operation) -> Self {
        Self {
            opid: op.header.opid,
            msgid: op.header.msgid,
            tag: op.header.tag,
            cancel: op.cancel_token().clone(),
        }
    }
}

/// Per-connection traffic and operation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnCounters {
    pub received: u64,
    pub admitted: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub busy: u64,
    pub bytes_read: u64,
    pub pdus_read: u64,
    pub bytes_written: u64,
    pub pdus_written: u64,
}

/// What an Abandon request found.
#[derive(Debug)]
pub(crate) enum AbandonOutcome {
    /// Removed from the pending queue before dispatch.
    Dequeued(Operation),
    /// Removed from the persistent set.
    Unparked(Operation),
    /// Running; its abandon flag is now set.
    Flagged,
    NotFound,
}

/// Monitoring snapshot of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub handle: TransportHandle,
    pub peer: String,
    pub local: String,
    pub state: ConnState,
    pub started: DateTime<Utc>,
    pub idle_ms: u64,
    pub bound_dn: String,
    pub mechanism: String,
    pub ssf: u32,
    pub executing: usize,
    pub pending: usize,
    pub persistent: usize,
    pub counters: ConnCounters,
    /// `r` reading, `w` blocked writer, `b` binding, `x` closing,
    /// `p` persistent operations, `c` internal client.
    pub flags: String,
}

/// One client connection.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) key: ConnKey,
    pub(crate) state: ConnState,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) peer: PeerInfo,
    pub(crate) auth: AuthInfo,
    pub(crate) executing: Vec<ExecutingOp>,
    pub(crate) pending: VecDeque<Operation>,
    pub(crate) persistent: Vec<Operation>,
    pub(crate) counters: ConnCounters,
    pub(crate) writewaiter: bool,
    pub(crate) reading: bool,
    pub(crate) started: DateTime<Utc>,
    pub(crate) last_activity: Instant,
    next_opid: u64,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        key: ConnKey,
        state: ConnState,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
        auth: AuthInfo,
    ) -> Self {
        Self {
            id,
            key,
            state,
            transport,
            peer,
            auth,
            executing: Vec::new(),
            pending: VecDeque::new(),
            persistent: Vec::new(),
            counters: ConnCounters::default(),
            writewaiter: false,
            reading: true,
            started: Utc::now(),
            last_activity: Instant::now(),
            next_opid: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn auth(&self) -> &AuthInfo {
        &self.auth
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn transport_handle(&self) -> TransportHandle {
        self.transport.handle()
    }

    pub fn counters(&self) -> &ConnCounters {
        &self.counters
    }

    pub fn executing_len(&self) -> usize {
        self.executing.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn persistent_len(&self) -> usize {
        self.persistent.len()
    }

    pub fn is_writewaiter(&self) -> bool {
        self.writewaiter
    }

    /// Message ids waiting in the pending queue, front first.
    pub fn pending_msgids(&self) -> Vec<MessageId> {
        self.pending.iter().map(|op| op.header.msgid).collect()
    }

    /// Queue accounting holds: `executing + pending == admitted - completed`.
    pub fn queues_consistent(&self) -> bool {
        let outstanding = self.counters.admitted.checked_sub(self.counters.completed);
        outstanding == Some((self.executing.len() + self.pending.len()) as u64)
    }

    pub(crate) fn next_opid(&mut self) -> u64 {
        self.next_opid += 1;
        self.next_opid
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// No operation is queued, running or parked.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.executing.is_empty() && self.pending.is_empty() && self.persistent.is_empty()
    }

    pub(crate) fn ready_to_free(&self) -> bool {
        self.state == ConnState::Closing && self.is_quiescent()
    }

    pub(crate) fn idle_expired(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.state, ConnState::Inactive | ConnState::Active)
            && self.is_quiescent()
            && !self.writewaiter
            && now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// Flag every running operation and empty the queues.
    ///
    /// Returns the dequeued operations for release; none of them gets a
    /// result. Running operations stay in `executing` until they finish.
    pub(crate) fn abandon_all(&mut self) -> Vec<Operation> {
        for running in &self.executing {
            running.cancel.abandon();
        }
        let queued = self.pending.len() as u64;
        self.counters.completed += queued;
        self.counters.abandoned += queued + self.persistent.len() as u64;
        let mut dropped: Vec<Operation> = self.pending.drain(..).collect();
        for parked in self.persistent.drain(..) {
            parked.cancel_token().abandon();
            dropped.push(parked);
        }
        dropped
    }

    /// Abandon the operation with message id `target`.
    pub(crate) fn abandon(&mut self, target: MessageId) -> AbandonOutcome {
        if let Some(pos) = self.pending.iter().position(|op| op.header.msgid == target) {
            if let Some(op) = self.pending.remove(pos) {
                op.cancel_token().abandon();
                self.counters.completed += 1;
                self.counters.abandoned += 1;
                return AbandonOutcome::Dequeued(op);
            }
        }
        if let Some(running) = self.executing.iter().find(|e| e.msgid == target) {
            running.cancel.abandon();
            return AbandonOutcome::Flagged;
        }
        if let Some(pos) = self.persistent.iter().position(|op| op.header.msgid == target) {
            let op = self.persistent.swap_remove(pos);
            op.cancel_token().abandon();
            self.counters.abandoned += 1;
            return AbandonOutcome::Unparked(op);
        }
        AbandonOutcome::NotFound
    }

    /// Move to `Closing`: stop reading and abandon everything outstanding.
    ///
    /// Returns the discarded queued and parked operations. Idempotent.
    pub(crate) fn mark_closing(&mut self, reason: &str) -> Vec<Operation> {
        if matches!(self.state, ConnState::Closing | ConnState::Invalid) {
            return Vec::new();
        }
        tracing::debug!(conn = self.id, reason, "connection closing");
        self.state = ConnState::Closing;
        if self.reading {
            self.reading = false;
            self.transport.stop_reading();
        }
        self.abandon_all()
    }

    /// Take a running operation out of `executing`, counting it completed.
    pub(crate) fn detach(&mut self, opid: u64) -> Option<ExecutingOp> {
        let pos = self.executing.iter().position(|e| e.opid == opid)?;
        self.counters.completed += 1;
        Some(self.executing.swap_remove(pos))
    }

    pub(crate) fn find_persistent_mut(&mut self, msgid: MessageId) -> Option<&mut Operation> {
        self.persistent.iter_mut().find(|op| op.header.msgid == msgid)
    }

    pub(crate) fn take_persistent(&mut self, msgid: MessageId) -> Option<Operation> {
        let pos = self.persistent.iter().position(|op| op.header.msgid == msgid)?;
        Some(self.persistent.swap_remove(pos))
    }

    pub fn info(&self) -> ConnectionInfo {
        let mut flags = String::new();
        if self.reading {
            flags.push('r');
        }
        if self.writewaiter {
            flags.push('w');
        }
        match self.state {
            ConnState::Binding => flags.push('b'),
            ConnState::Closing => flags.push('x'),
            ConnState::Client => flags.push('c'),
            _ => {}
        }
        if !self.persistent.is_empty() {
            flags.push('p');
        }
        ConnectionInfo {
            id: self.id,
            handle: self.transport.handle(),
            peer: self.peer.peer.clone(),
            local: self.peer.local.clone(),
            state: self.state,
            started: self.started,
            idle_ms: self.last_activity.elapsed().as_millis() as u64,
            bound_dn: self.auth.dn.clone(),
            mechanism: self.auth.mechanism.clone(),
            ssf: self.auth.ssf.ssf,
            executing: self.executing.len(),
            pending: self.pending.len(),
            persistent: self.persistent.len(),
            counters: self.counters.clone(),
            flags,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("executing", &self.executing.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
