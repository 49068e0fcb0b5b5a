//! The seam to LDAP operation semantics.
//!
//! Bind, search, modify and the rest live outside the core. A worker hands
//! each operation to the installed [`OperationHandler`] through an
//! [`OpContext`], which is the handler's only way to talk back: results,
//! entries, storage transactions and connection side effects all go
//! through it.

use crate::connection::{writer, AuthInfo, ConnHandle};
use crate::error::{CoreError, ResultCode};
use crate::operation::{CancelToken, OpArena, OpHeader, Operation};
use crate::protocol::{MessageId, RequestTag};
use crate::scheduler::dispatch::DispatchInner;
use crate::transport::LdapResult;
use crate::txn::OpTxns;

/// How a handler finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    /// Stopped early because the operation was abandoned or cancelled.
    Abandoned,
    /// Keep the operation parked on its connection for notifications.
    Persistent,
    /// The request was malformed beyond recovery; the connection closes.
    ProtocolError(String),
}

/// Executes one operation on a worker thread.
pub trait OperationHandler: Send + Sync {
    fn handle(&self, ctx: &mut OpContext<'_>) -> HandlerOutcome;
}

/// Per-execution view of an operation and its connection.
pub struct OpContext<'a> {
    core: &'a DispatchInner,
    handle: &'a ConnHandle,
    op: &'a mut Operation,
    txns: OpTxns,
}

impl<'a> OpContext<'a> {
    pub(crate) fn new(core: &'a DispatchInner, handle: &'a ConnHandle, op: &'a mut Operation) -> Self {
        Self { core, handle, op, txns: OpTxns::new() }
    }

    pub fn op(&self) -> &Operation {
        self.op
    }

    pub fn op_mut(&mut self) -> &mut Operation {
        self.op
    }

    pub fn header(&self) -> &OpHeader {
        &self.op.header
    }

    pub fn msgid(&self) -> MessageId {
        self.op.msgid()
    }

    pub fn tag(&self) -> RequestTag {
        self.op.tag()
    }

    /// Identity of the connection when this operation was dispatched.
    pub fn auth(&self) -> &AuthInfo {
        self.op.auth()
    }

    pub fn connection(&self) -> &ConnHandle {
        self.handle
    }

    /// Poll at natural yield points; stop work once set.
    pub fn is_abandoned(&self) -> bool {
        self.op.is_abandoned()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.op.cancel_token()
    }

    pub fn arena_mut(&mut self) -> &mut OpArena {
        self.op.arena_mut()
    }

    /// Storage transactions bound to this operation. Released when the
    /// handler returns.
    pub fn txns(&mut self) -> &mut OpTxns {
        &mut self.txns
    }

    /// Send the final response. Suppressed for abandoned operations and
    /// for requests that have no response.
    pub fn send_result(&mut self, code: ResultCode, message: &str) -> Result<(), CoreError> {
        if self.op.is_abandoned() {
            tracing::debug!(msgid = self.msgid(), %code, "result suppressed for abandoned operation");
            return Ok(());
        }
        let Some(rtag) = self.tag().response_tag() else { return Ok(()) };
        let bytes = self.core.encoder.encode_result(self.msgid(), rtag, &LdapResult::new(code, message));
        self.write(&bytes)?;
        self.op.body.result = Some(code);
        Ok(())
    }

    /// Send one already-encoded search entry.
    pub fn send_entry(&mut self, entry: &[u8]) -> Result<(), CoreError> {
        if self.op.is_abandoned() {
            return Ok(());
        }
        let bytes = self.core.encoder.encode_entry(self.msgid(), entry);
        self.write(&bytes)?;
        self.op.body.entries_sent += 1;
        Ok(())
    }

    /// Report `err` as this operation's result.
    pub fn fail(&mut self, err: &CoreError) -> Result<(), CoreError> {
        if err.is_connection_fatal() {
            self.request_disconnect();
        }
        self.send_result(err.result_code(), &err.to_string())
    }

    /// Identity to install on the connection when this operation completes.
    pub fn set_bound_identity(&mut self, auth: AuthInfo) {
        self.op.body.new_auth = Some(auth);
    }

    /// Close the connection once this operation completes.
    pub fn request_disconnect(&mut self) {
        self.op.body.disconnect = true;
    }

    pub fn mark_persistent(&mut self) {
        self.op.body.persistent = true;
    }

    /// Cancel another operation on the same connection.
    pub fn cancel(&self, target: MessageId) -> ResultCode {
        if target == self.msgid() {
            return ResultCode::UnwillingToPerform;
        }
        self.core.cancel(self.handle, target)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        let result = writer::write_pdu(self.handle, bytes, self.core.write_timeout);
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                tracing::warn!(msgid = self.msgid(), error = %e, "response write failed");
                self.op.body.disconnect = true;
            }
        }
        result
    }

    pub(crate) fn finish(mut self) {
        self.txns.release_all();
    }
}
