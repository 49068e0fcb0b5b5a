//! Span utilities for operation tracing.

use tracing::{info_span, Span};

use crate::error::ResultCode;
use crate::protocol::{MessageId, RequestTag};

/// Extension trait for recording outcomes into spans.
pub trait SpanExt {
    /// Record a `Result` as `status` plus `error.message` on failure.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;

    /// Record the LDAP result code sent for an operation.
    fn record_code(&self, code: ResultCode);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }

    fn record_code(&self, code: ResultCode) {
        self.record("result", code.code());
    }
}

/// Factory for the per-operation span.
pub struct OperationSpan;

impl OperationSpan {
    /// Span fields:
    /// - `conn`, `op`, `msgid`, `tag`: operation identity
    /// - `status`, `error.message`: filled by [`SpanExt::record_result`]
    /// - `result`: filled by [`SpanExt::record_code`]
    /// - `latency_us`: filled on completion
    pub fn new(conn: u64, opid: u64, msgid: MessageId, tag: RequestTag) -> Span {
        info_span!(
            "ldap_operation",
            conn = conn,
            op = opid,
            msgid = msgid,
            tag = %tag,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            result = tracing::field::Empty,
            latency_us = tracing::field::Empty,
        )
    }
}

/// Span covering one connection's lifetime events.
pub fn connection_span(conn: u64, peer: &str) -> Span {
    info_span!("ldap_connection", conn = conn, peer = %peer)
}
