//! Dispatch and completion.
//!
//! The receiving thread runs admission with the connection locked and either
//! submits the operation to the worker pool or queues it on the connection.
//! A worker runs the handler, then relocks the connection through the table
//! to detach the operation, apply its side effects and reschedule queued
//! work. Completion is also where closing connections get freed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use super::admission::{self, AdmissionInput, AdmissionLimits, Decision, DeferReason};
use super::worker_pool::{ExitHook, Job, SubmitError, WorkerPool};
use crate::config::CoreConfig;
use crate::connection::{
    writer, AbandonOutcome, AuthInfo, ConnHandle, ConnState, ConnectionInfo, ConnectionTable,
    ExecutingOp, LockedConn,
};
use crate::error::{CoreError, ResultCode};
use crate::handler::{HandlerOutcome, OpContext, OperationHandler};
use crate::operation::{CancelState, Operation, OperationPool};
use crate::protocol::{Decoded, MessageId, Pdu, PduSource, RequestTag, TransportHandle};
use crate::shutdown::{ShutdownCoordinator, ShutdownGuard, ShutdownResult, ShutdownState};
use crate::stats::{CoreStats, StatsSnapshot};
use crate::telemetry::{metrics, OperationSpan, SpanExt};
use crate::transport::{LdapResult, PeerInfo, ResponseEncoder, SecurityFactors, Transport};
use crate::txn::cache;

/// What happened to a received request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Submitted to the worker pool.
    Executing,
    /// Appended to the connection's pending queue.
    Queued(DeferReason),
    /// Abandon or Unbind, done on the receiving thread.
    HandledLocally,
    /// The connection is closing; the request was ignored.
    Dropped,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Connection slots freed.
    pub closed: usize,
    /// Connections whose pending queue was kicked.
    pub rescheduled: usize,
}

pub(crate) struct DispatchInner {
    pub(crate) table: ConnectionTable,
    pub(crate) ops: OperationPool,
    workers: WorkerPool<OpJob>,
    handler: Arc<dyn OperationHandler>,
    pub(crate) encoder: Arc<dyn ResponseEncoder>,
    limits: RwLock<AdmissionLimits>,
    pub(crate) stats: CoreStats,
    shutdown: ShutdownCoordinator,
    pub(crate) write_timeout: Option<Duration>,
}

/// An operation travelling to a worker thread.
pub(crate) struct OpJob {
    core: Arc<DispatchInner>,
    handle: ConnHandle,
    op: Operation,
    _guard: ShutdownGuard,
}

impl Job for OpJob {
    fn run(self) {
        let OpJob { core, handle, mut op, _guard } = self;
        let outcome = core.execute(&handle, &mut op);
        core.complete(&handle, op, outcome);
    }
}

/// A handler panicked mid-operation. Answer the client if it has not been
/// answered yet and let completion detach the operation as usual.
fn handler_panicked(ctx: &mut OpContext<'_>) -> HandlerOutcome {
    tracing::error!(msgid = ctx.msgid(), tag = ?ctx.tag(), "operation handler panicked");
    let body = &mut ctx.op_mut().body;
    body.persistent = false;
    body.new_auth = None;
    if ctx.is_abandoned() {
        return HandlerOutcome::Abandoned;
    }
    if ctx.op().result().is_none() {
        if let Err(e) = ctx.send_result(ResultCode::Other, "internal error") {
            tracing::debug!(error = %e, "panic result not delivered");
        }
    }
    HandlerOutcome::Done
}

/// Entry point of the request-processing core.
///
/// Cheap to clone; every clone drives the same table, pool and workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl Dispatcher {
    pub fn new(
        config: &CoreConfig,
        handler: Arc<dyn OperationHandler>,
        encoder: Arc<dyn ResponseEncoder>,
    ) -> Result<Self, CoreError> {
        let config = config.clone().normalized();
        let hook: ExitHook = Arc::new(|| {
            let flushed = cache::flush_thread();
            if flushed > 0 {
                tracing::debug!(flushed, "worker exiting, cached readers flushed");
            }
        });
        let workers = WorkerPool::with_exit_hook(config.worker_pool_config(), hook)?;
        let inner = DispatchInner {
            table: ConnectionTable::new(config.table_config()),
            ops: OperationPool::new(config.op_pool_config()),
            workers,
            handler,
            encoder,
            limits: RwLock::new(config.admission_limits()),
            stats: CoreStats::default(),
            shutdown: ShutdownCoordinator::new(),
            write_timeout: config.write_timeout(),
        };
        tracing::info!(
            max_connections = config.max_connections,
            workers = inner.workers.capacity(),
            "dispatcher started"
        );
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Register a freshly accepted network connection.
    pub fn accept(
        &self,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
        security: SecurityFactors,
    ) -> Result<ConnHandle, CoreError> {
        if !self.inner.shutdown.is_accepting() {
            return Err(CoreError::ShuttingDown);
        }
        let handle = self.inner.table.create(transport, peer, security)?;
        self.inner.stats.connection_opened();
        Ok(handle)
    }

    /// Register an in-process client connection acting as `auth`.
    pub fn accept_client(
        &self,
        transport: Arc<dyn Transport>,
        peer: PeerInfo,
        auth: AuthInfo,
    ) -> Result<ConnHandle, CoreError> {
        if !self.inner.shutdown.is_accepting() {
            return Err(CoreError::ShuttingDown);
        }
        let handle = self.inner.table.create_client(transport, peer, auth)?;
        self.inner.stats.connection_opened();
        Ok(handle)
    }

    /// Admit one decoded request arriving on `th`.
    ///
    /// `Err(Busy)` means this request was refused and a Busy result sent;
    /// the connection and its queue are unaffected.
    pub fn receive(&self, th: TransportHandle, pdu: Pdu) -> Result<Received, CoreError> {
        let conn = self.inner.table.lookup(th)?;
        self.inner.receive(conn, pdu)
    }

    /// Decode and admit every complete PDU buffered on `th`.
    ///
    /// Returns the number of PDUs decoded. A decode failure closes the
    /// connection with a notice of disconnection.
    pub fn drain_input(
        &self,
        th: TransportHandle,
        source: &mut dyn PduSource,
    ) -> Result<usize, CoreError> {
        let mut decoded = 0;
        loop {
            match source.decode_next() {
                Ok(Decoded::Pdu(pdu)) => {
                    decoded += 1;
                    match self.receive(th, pdu) {
                        Ok(Received::Dropped) => break,
                        Ok(_) | Err(CoreError::Busy { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(Decoded::WouldBlock) => break,
                Ok(Decoded::Closed) => {
                    self.close(th, "peer closed")?;
                    break;
                }
                Err(e) => {
                    let conn = self.inner.table.lookup(th)?;
                    self.inner.protocol_close(conn, e.to_string())?;
                    break;
                }
            }
        }
        Ok(decoded)
    }

    /// The transport for `th` can accept writes again. Wakes the blocked
    /// writer and dispatches requests deferred behind it.
    pub fn writable(&self, th: TransportHandle) -> Result<(), CoreError> {
        let mut conn = self.inner.table.lookup(th)?;
        conn.writewaiter = false;
        conn.handle().io.write_cv.notify_all();
        self.inner.resched(conn);
        Ok(())
    }

    /// Start closing the connection on `th`.
    pub fn close(&self, th: TransportHandle, reason: &str) -> Result<(), CoreError> {
        let conn = self.inner.table.lookup(th)?;
        self.inner.close_locked(conn, reason);
        Ok(())
    }

    /// Cancel the executing operation `target` on `handle`'s connection and
    /// wait for the worker's answer.
    pub fn cancel(&self, handle: &ConnHandle, target: MessageId) -> ResultCode {
        self.inner.cancel(handle, target)
    }

    /// Deliver one entry to the parked persistent operation `msgid`.
    ///
    /// Returns false if no such live persistent operation exists.
    pub fn notify_persistent(
        &self,
        handle: &ConnHandle,
        msgid: MessageId,
        entry: &[u8],
    ) -> Result<bool, CoreError> {
        let mut conn = self.inner.table.relock(handle)?;
        let Some(op) = conn.find_persistent_mut(msgid) else { return Ok(false) };
        if op.is_abandoned() {
            return Ok(false);
        }
        op.body.entries_sent += 1;
        let bytes = self.inner.encoder.encode_entry(msgid, entry);
        let handle = conn.unlock();
        self.inner.write(&handle, &bytes).map(|()| true)
    }

    /// End a persistent operation with a final result.
    pub fn finish_persistent(
        &self,
        handle: &ConnHandle,
        msgid: MessageId,
        code: ResultCode,
    ) -> Result<bool, CoreError> {
        let mut conn = self.inner.table.relock(handle)?;
        let Some(op) = conn.take_persistent(msgid) else { return Ok(false) };
        let handle = conn.unlock();
        let written = match op.tag().response_tag() {
            Some(rtag) => {
                let bytes = self.inner.encoder.encode_result(msgid, rtag, &LdapResult::new(code, ""));
                self.inner.write(&handle, &bytes)
            }
            None => Ok(()),
        };
        self.inner.ops.release(op);
        written.map(|()| true)
    }

    /// Close idle connections, free finished closing ones, and retry
    /// stalled pending queues.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let closed = self.inner.table.sweep_idle(now);
        let rescheduled = self.resched_all();
        if closed > 0 || rescheduled > 0 {
            tracing::debug!(closed, rescheduled, "sweep");
        }
        SweepReport { closed, rescheduled }
    }

    /// Reschedule every connection that has dispatchable pending work or is
    /// ready to be freed.
    pub fn resched_all(&self) -> usize {
        let cap = self.limits().executing_cap(self.inner.workers.capacity());
        let mut kicked = 0;
        for handle in self.inner.table.handles() {
            let Ok(conn) = self.inner.table.relock(&handle) else { continue };
            let stalled = conn.pending_len() > 0 && conn.executing_len() < cap;
            if stalled || conn.ready_to_free() {
                kicked += 1;
                self.inner.resched(conn);
            }
        }
        kicked
    }

    pub fn limits(&self) -> AdmissionLimits {
        *self.inner.limits.read()
    }

    /// Swap admission limits with the worker pool paused.
    ///
    /// Must not be called from a worker thread.
    pub fn reconfigure(&self, limits: AdmissionLimits) {
        self.inner.workers.pause();
        *self.inner.limits.write() = limits;
        self.inner.workers.resume();
        tracing::info!(?limits, "admission limits updated");
        self.resched_all();
    }

    /// Close every connection, wait up to `timeout` for running operations,
    /// then stop the worker pool.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownResult {
        let core = &self.inner;
        if !core.shutdown.begin() {
            return ShutdownResult::Complete;
        }
        tracing::info!(connections = core.table.len(), "shutdown: closing connections");
        let notice = core
            .encoder
            .encode_disconnect(&LdapResult::new(ResultCode::Unavailable, "server shutting down"));
        for handle in core.table.handles() {
            let Ok(mut conn) = core.table.relock(&handle) else { continue };
            let dropped = conn.mark_closing("shutdown");
            core.discard(dropped);
            let handle = conn.unlock();
            writer::try_write_once(&handle, &notice);
            if let Ok(conn) = core.table.relock(&handle) {
                core.resched(conn);
            }
        }

        let result = core.shutdown.wait_for_drain(timeout);
        core.ops.begin_shutdown();
        core.workers.shutdown();
        core.shutdown.finish();
        core.table.sweep_idle(Instant::now());
        match &result {
            ShutdownResult::Complete => tracing::info!("shutdown complete"),
            ShutdownResult::Timeout { remaining } => {
                tracing::warn!(remaining, "shutdown timed out with operations in flight")
            }
        }
        result
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.inner.shutdown.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let connections = self.inner.table.snapshot();
        let write_waiters = connections.iter().filter(|c| c.flags.contains('w')).count();
        self.inner.stats.snapshot(
            connections.len(),
            write_waiters,
            self.inner.ops.stats(),
            self.inner.workers.stats(),
        )
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.table.snapshot()
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.inner.table
    }

    pub fn op_pool(&self) -> &OperationPool {
        &self.inner.ops
    }

    pub fn worker_capacity(&self) -> usize {
        self.inner.workers.capacity()
    }
}

impl DispatchInner {
    fn receive(self: &Arc<Self>, mut conn: LockedConn, pdu: Pdu) -> Result<Received, CoreError> {
        let tag = pdu.tag;
        let opid = conn.next_opid();
        conn.counters.received += 1;
        conn.counters.pdus_read += 1;
        conn.counters.bytes_read += pdu.wire_len as u64;
        conn.touch();
        self.stats.pdu_read(pdu.wire_len);

        if tag == RequestTag::Bind && !matches!(conn.state, ConnState::Closing | ConnState::Invalid) {
            let dropped = conn.abandon_all();
            if !dropped.is_empty() || conn.executing_len() > 0 {
                tracing::debug!(
                    conn = conn.id(),
                    dequeued = dropped.len(),
                    running = conn.executing_len(),
                    "bind abandons outstanding operations"
                );
            }
            self.discard(dropped);
        }

        let limits = *self.limits.read();
        let cap = limits.executing_cap(self.workers.capacity());
        match admission::decide(&AdmissionInput::of(&conn, tag), cap) {
            Decision::Abandon => self.abandon_locally(conn, &pdu),
            Decision::Unbind => {
                tracing::debug!(conn = conn.id(), "unbind");
                self.close_locked(conn, "unbind");
                Ok(Received::HandledLocally)
            }
            Decision::Reject => {
                tracing::debug!(conn = conn.id(), msgid = pdu.msgid, %tag, "request on closing connection dropped");
                Ok(Received::Dropped)
            }
            Decision::Execute => {
                let op = self.admit(&mut conn, opid, pdu);
                if self.activate(&mut conn, op) {
                    Ok(Received::Executing)
                } else {
                    Ok(Received::Queued(DeferReason::PendingOperations))
                }
            }
            Decision::Defer(reason) => {
                let ceiling = limits.ceiling(&conn.auth);
                let depth = conn.pending_len() + 1;
                if depth > ceiling {
                    return self.reject_busy(conn, &pdu, depth, ceiling);
                }
                let op = self.admit(&mut conn, opid, pdu);
                tracing::debug!(conn = conn.id(), msgid = op.msgid(), ?reason, depth, "request queued");
                conn.pending.push_back(op);
                Ok(Received::Queued(reason))
            }
        }
    }

    fn admit(&self, conn: &mut LockedConn, opid: u64, pdu: Pdu) -> Operation {
        if conn.state == ConnState::Inactive {
            conn.state = ConnState::Active;
        }
        conn.counters.admitted += 1;
        self.ops.acquire(conn.id(), opid, pdu)
    }

    fn reject_busy(
        &self,
        mut conn: LockedConn,
        pdu: &Pdu,
        depth: usize,
        ceiling: usize,
    ) -> Result<Received, CoreError> {
        conn.counters.busy += 1;
        self.stats.busy_rejection();
        metrics::record_busy_rejection();
        tracing::warn!(conn = conn.id(), msgid = pdu.msgid, depth, ceiling, "too many pending operations");
        let handle = conn.unlock();
        if let Some(rtag) = pdu.tag.response_tag() {
            let result = LdapResult::new(ResultCode::Busy, "too many pending operations");
            let bytes = self.encoder.encode_result(pdu.msgid, rtag, &result);
            if !writer::try_write_once(&handle, &bytes) {
                tracing::debug!(conn = handle.id(), "busy result not delivered");
            }
        }
        Err(CoreError::Busy { pending: depth, max: ceiling })
    }

    fn abandon_locally(self: &Arc<Self>, mut conn: LockedConn, pdu: &Pdu) -> Result<Received, CoreError> {
        let target = match pdu.abandon_target() {
            Ok(target) => target,
            Err(e) => return self.protocol_close(conn, e.to_string()),
        };
        match conn.abandon(target) {
            AbandonOutcome::Dequeued(op) | AbandonOutcome::Unparked(op) => {
                tracing::debug!(conn = conn.id(), target, "abandoned before execution");
                self.discard(vec![op]);
            }
            AbandonOutcome::Flagged => tracing::debug!(conn = conn.id(), target, "abandon flagged running operation"),
            AbandonOutcome::NotFound => tracing::debug!(conn = conn.id(), target, "abandon target not found"),
        }
        self.resched(conn);
        Ok(Received::HandledLocally)
    }

    /// Hand `op` to the worker pool. On rejection it goes back to the front
    /// of the pending queue for a later retry and this returns false.
    fn activate(self: &Arc<Self>, conn: &mut LockedConn, mut op: Operation) -> bool {
        let Some(guard) = self.shutdown.track() else {
            conn.pending.push_front(op);
            return false;
        };
        op.body.auth = conn.auth.clone();
        let tag = op.tag();
        conn.executing.push(ExecutingOp::of(&op));
        let job = OpJob { core: self.clone(), handle: conn.handle().clone(), op, _guard: guard };
        match self.workers.submit(job) {
            Ok(()) => {
                if tag == RequestTag::Bind && conn.state != ConnState::Client {
                    conn.state = ConnState::Binding;
                    conn.auth.reset_identity();
                }
                self.stats.op_initiated(tag);
                metrics::record_op_initiated(tag);
                true
            }
            Err(SubmitError { job, reason }) => {
                let OpJob { op, .. } = job;
                conn.executing.retain(|e| e.opid != op.header.opid);
                self.stats.submit_failure();
                metrics::record_submit_failure();
                tracing::warn!(conn = conn.id(), msgid = op.msgid(), error = %reason, "submit rejected, operation requeued");
                conn.pending.push_front(op);
                false
            }
        }
    }

    fn execute(&self, handle: &ConnHandle, op: &mut Operation) -> HandlerOutcome {
        let span = OperationSpan::new(op.header.connid, op.header.opid, op.msgid(), op.tag());
        let _entered = span.enter();
        op.body.arena.reset();

        let outcome = if op.is_abandoned() {
            HandlerOutcome::Abandoned
        } else {
            let mut ctx = OpContext::new(self, handle, op);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(&mut ctx)))
                .unwrap_or_else(|_| handler_panicked(&mut ctx));
            ctx.finish();
            outcome
        };

        match &outcome {
            HandlerOutcome::Done => span.record("status", "ok"),
            HandlerOutcome::Abandoned => span.record("status", "abandoned"),
            HandlerOutcome::Persistent => {
                op.body.persistent = true;
                span.record("status", "persistent")
            }
            HandlerOutcome::ProtocolError(msg) => {
                op.body.disconnect = true;
                tracing::warn!(error = %msg, "handler reported protocol error");
                span.record("status", "error").record("error.message", msg.as_str())
            }
        };
        if let Some(code) = op.result() {
            span.record_code(code);
        }
        span.record("latency_us", op.header.started_at.elapsed().as_micros() as u64);
        outcome
    }

    fn complete(self: &Arc<Self>, handle: &ConnHandle, mut op: Operation, outcome: HandlerOutcome) {
        let token = op.cancel_token().clone();
        let tag = op.tag();
        let msgid = op.msgid();

        if token.state() == CancelState::Requested {
            let answer = token.resolve(outcome == HandlerOutcome::Abandoned);
            if answer == CancelState::Acked {
                if let Some(rtag) = tag.response_tag() {
                    let bytes = self.encoder.encode_result(msgid, rtag, &LdapResult::new(ResultCode::Canceled, ""));
                    if let Err(e) = writer::write_pdu(handle, &bytes, self.write_timeout) {
                        tracing::debug!(error = %e, msgid, "canceled result not delivered");
                    }
                }
            }
            token.settle();
        }
        if let HandlerOutcome::ProtocolError(msg) = &outcome {
            let notice = self
                .encoder
                .encode_disconnect(&LdapResult::new(ResultCode::ProtocolError, msg.clone()));
            writer::try_write_once(handle, &notice);
        }

        let Ok(mut conn) = self.table.relock(handle) else {
            tracing::error!(conn = handle.id(), msgid, "completion for a freed connection");
            self.ops.release(op);
            return;
        };
        conn.detach(op.header.opid);
        // Once detached no canceller can find it; answer a late request.
        if token.state() == CancelState::Requested {
            token.resolve(false);
        }

        if tag == RequestTag::Bind && conn.state == ConnState::Binding {
            conn.state = ConnState::Active;
        }
        if let Some(identity) = op.body.new_auth.take() {
            if !op.is_abandoned() {
                let auth = &mut conn.auth;
                auth.dn = identity.dn;
                auth.mechanism = identity.mechanism;
                auth.version = identity.version;
                if identity.ssf.sasl > 0 {
                    auth.ssf.sasl = identity.ssf.sasl;
                    auth.ssf.ssf = auth.ssf.ssf.max(identity.ssf.sasl);
                }
            }
        }

        self.stats.op_completed(tag);
        metrics::record_op_completed(tag, op.header.started_at.elapsed().as_micros() as u64);
        if op.disconnect_requested() {
            let dropped = conn.mark_closing("operation requested disconnect");
            self.discard(dropped);
        }
        if op.is_persistent() && !op.is_abandoned() && conn.state != ConnState::Closing {
            tracing::debug!(conn = conn.id(), msgid, "operation parked as persistent");
            conn.persistent.push(op);
        } else {
            if op.is_abandoned() {
                metrics::record_op_abandoned(tag);
            }
            self.ops.release(op);
        }
        metrics::record_op_pool(self.ops.available());
        self.resched(conn);
    }

    /// Dispatch queued work or finish a close.
    fn resched(self: &Arc<Self>, mut conn: LockedConn) {
        if conn.state == ConnState::Closing {
            let _ = self.table.try_finalize_close(conn);
            return;
        }
        let cap = self.limits.read().executing_cap(self.workers.capacity());
        while matches!(conn.state, ConnState::Active | ConnState::Client) && conn.executing_len() < cap {
            match conn.pending.front() {
                None => break,
                Some(front) if front.tag() == RequestTag::Bind && conn.executing_len() > 0 => break,
                Some(_) => {}
            }
            let Some(op) = conn.pending.pop_front() else { break };
            if !self.activate(&mut conn, op) {
                break;
            }
        }
    }

    fn close_locked(self: &Arc<Self>, mut conn: LockedConn, reason: &str) {
        let dropped = conn.mark_closing(reason);
        self.discard(dropped);
        self.resched(conn);
    }

    fn protocol_close(self: &Arc<Self>, mut conn: LockedConn, message: String) -> Result<Received, CoreError> {
        tracing::warn!(conn = conn.id(), error = %message, "protocol error, closing connection");
        let notice = self
            .encoder
            .encode_disconnect(&LdapResult::new(ResultCode::ProtocolError, message.clone()));
        let dropped = conn.mark_closing("protocol error");
        self.discard(dropped);
        let handle = conn.unlock();
        writer::try_write_once(&handle, &notice);
        if let Ok(conn) = self.table.relock(&handle) {
            self.resched(conn);
        }
        Err(CoreError::Protocol(message))
    }

    /// Write a response from outside a handler, closing on fatal errors.
    fn write(self: &Arc<Self>, handle: &ConnHandle, bytes: &[u8]) -> Result<(), CoreError> {
        let result = writer::write_pdu(handle, bytes, self.write_timeout);
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                if let Ok(conn) = self.table.relock(handle) {
                    self.close_locked(conn, "write failure");
                }
            }
        }
        result
    }

    pub(crate) fn cancel(&self, handle: &ConnHandle, target: MessageId) -> ResultCode {
        let Ok(conn) = self.table.relock(handle) else { return ResultCode::NoSuchOperation };
        if conn.pending.iter().any(|op| op.msgid() == target) {
            return ResultCode::CannotCancel;
        }
        let Some(running) = conn.executing.iter().find(|e| e.msgid == target) else {
            return ResultCode::NoSuchOperation;
        };
        let token = running.cancel.clone();
        if token.state() != CancelState::None {
            return ResultCode::ProtocolError;
        }
        if token.is_abandoned() {
            return ResultCode::TooLate;
        }
        if token.request_cancel().is_err() {
            return ResultCode::ProtocolError;
        }
        drop(conn);

        let answer = token.wait_resolved();
        token.finish();
        tracing::debug!(conn = handle.id(), target, ?answer, "cancel resolved");
        match answer {
            CancelState::Acked => ResultCode::Success,
            _ => ResultCode::TooLate,
        }
    }

    /// Return never-dispatched operations to the pool.
    fn discard(&self, ops: Vec<Operation>) {
        if ops.is_empty() {
            return;
        }
        self.stats.abandoned(ops.len() as u64);
        for op in ops {
            metrics::record_op_abandoned(op.tag());
            self.ops.release(op);
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
