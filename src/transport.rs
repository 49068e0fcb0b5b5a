//! Transport and response-encoding seams.
//!
//! The listener, TLS layer and BER encoder are external. The core only
//! needs a non-blocking write, a way to drop read interest, and a way to
//! turn results into bytes.

use std::io;

use serde::Serialize;

use crate::error::ResultCode;
use crate::protocol::{MessageId, TransportHandle};

/// A connected transport endpoint.
pub trait Transport: Send + Sync {
    fn handle(&self) -> TransportHandle;

    /// Write as much of `buf` as the endpoint accepts without blocking.
    ///
    /// Returns `ErrorKind::WouldBlock` when nothing can be written now.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Stop delivering read readiness for this endpoint.
    fn stop_reading(&self);

    /// Release the endpoint. Called once, when the connection slot is freed.
    fn close(&self);
}

/// Addresses of a connection's endpoints, as reported by the listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub peer: String,
    pub local: String,
}

impl PeerInfo {
    pub fn new(peer: impl Into<String>, local: impl Into<String>) -> Self {
        Self { peer: peer.into(), local: local.into() }
    }
}

/// Security strength factors negotiated for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecurityFactors {
    pub transport: u32,
    pub tls: u32,
    pub sasl: u32,
    /// Overall strength, the maximum of the layers.
    pub ssf: u32,
}

impl SecurityFactors {
    pub fn new(transport: u32, tls: u32, sasl: u32) -> Self {
        Self { transport, tls, sasl, ssf: transport.max(tls).max(sasl) }
    }
}

/// An LDAPResult as handed to the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
}

impl LdapResult {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self { code, matched_dn: String::new(), message: message.into() }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }
}

/// The external BER encoder for responses.
pub trait ResponseEncoder: Send + Sync {
    /// Encode a final response for `msgid` with the given response tag.
    fn encode_result(&self, msgid: MessageId, response_tag: u8, result: &LdapResult) -> Vec<u8>;

    /// Encode a SearchResultEntry carrying an already-encoded entry.
    fn encode_entry(&self, msgid: MessageId, entry: &[u8]) -> Vec<u8>;

    /// Encode an unsolicited Notice of Disconnection.
    fn encode_disconnect(&self, result: &LdapResult) -> Vec<u8>;
}
