//! Decoded LDAP request units and the wire-layer seam.
//!
//! The BER codec lives outside this crate. It hands the core one decoded
//! PDU at a time through [`PduSource`]; the core never touches raw frames.

use std::fmt;

use thiserror::Error;

/// Opaque identifier of a transport endpoint (socket, pipe, in-process
/// client). Unique among live connections, reusable after close.
pub type TransportHandle = u64;

/// LDAP message id as carried on the wire.
pub type MessageId = i32;

/// Request protocol-op tags (BER application tags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestTag {
    Bind = 0x60,
    Unbind = 0x42,
    Search = 0x63,
    Modify = 0x66,
    Add = 0x68,
    Delete = 0x4a,
    ModDn = 0x6c,
    Compare = 0x6e,
    Abandon = 0x50,
    Extended = 0x77,
}

impl RequestTag {
    /// All request tags, in stable statistics order.
    pub const ALL: [RequestTag; 10] = [
        RequestTag::Bind,
        RequestTag::Unbind,
        RequestTag::Search,
        RequestTag::Modify,
        RequestTag::Add,
        RequestTag::Delete,
        RequestTag::ModDn,
        RequestTag::Compare,
        RequestTag::Abandon,
        RequestTag::Extended,
    ];

    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u8 == tag)
    }

    /// Position in [`RequestTag::ALL`], used to index per-tag counters.
    pub fn index(self) -> usize {
        match self {
            RequestTag::Bind => 0,
            RequestTag::Unbind => 1,
            RequestTag::Search => 2,
            RequestTag::Modify => 3,
            RequestTag::Add => 4,
            RequestTag::Delete => 5,
            RequestTag::ModDn => 6,
            RequestTag::Compare => 7,
            RequestTag::Abandon => 8,
            RequestTag::Extended => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RequestTag::Bind => "bind",
            RequestTag::Unbind => "unbind",
            RequestTag::Search => "search",
            RequestTag::Modify => "modify",
            RequestTag::Add => "add",
            RequestTag::Delete => "delete",
            RequestTag::ModDn => "moddn",
            RequestTag::Compare => "compare",
            RequestTag::Abandon => "abandon",
            RequestTag::Extended => "extended",
        }
    }

    /// Tag of the final response PDU, or `None` for requests that never
    /// get a response (Unbind, Abandon).
    pub fn response_tag(self) -> Option<u8> {
        match self {
            RequestTag::Bind => Some(0x61),
            RequestTag::Search => Some(0x65),
            RequestTag::Modify => Some(0x67),
            RequestTag::Add => Some(0x69),
            RequestTag::Delete => Some(0x6b),
            RequestTag::ModDn => Some(0x6d),
            RequestTag::Compare => Some(0x6f),
            RequestTag::Extended => Some(0x78),
            RequestTag::Unbind | RequestTag::Abandon => None,
        }
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request control attached to a PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// One decoded LDAP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub msgid: MessageId,
    pub tag: RequestTag,
    /// Content octets of the protocol op, still BER-encoded below the top
    /// level. Interpreted by handlers, not by the core.
    pub value: Vec<u8>,
    pub controls: Vec<Control>,
    /// Size of the whole frame on the wire, for read accounting.
    pub wire_len: usize,
}

impl Pdu {
    pub fn new(msgid: MessageId, tag: RequestTag, value: Vec<u8>) -> Self {
        let wire_len = value.len() + 8;
        Self { msgid, tag, value, controls: Vec::new(), wire_len }
    }

    /// Build an Abandon request targeting `target`.
    pub fn abandon(msgid: MessageId, target: MessageId) -> Self {
        Self::new(msgid, RequestTag::Abandon, encode_int(target))
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    /// Message id named by an Abandon request.
    ///
    /// The Abandon op is a primitive INTEGER, so its content octets are a
    /// big-endian two's complement value of one to four bytes.
    pub fn abandon_target(&self) -> Result<MessageId, DecodeError> {
        if self.tag != RequestTag::Abandon {
            return Err(DecodeError::Malformed(format!(
                "{} request has no abandon target",
                self.tag
            )));
        }
        decode_int(&self.value)
    }
}

/// Encode an INTEGER's content octets (minimal two's complement).
pub fn encode_int(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let b = bytes[start];
        let next_high = bytes[start + 1] & 0x80;
        if (b == 0x00 && next_high == 0) || (b == 0xff && next_high != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

/// Decode an INTEGER's content octets into a message id.
pub fn decode_int(content: &[u8]) -> Result<MessageId, DecodeError> {
    if content.is_empty() || content.len() > 4 {
        return Err(DecodeError::Malformed(format!(
            "integer of {} octets",
            content.len()
        )));
    }
    let fill = if content[0] & 0x80 != 0 { 0xff } else { 0x00 };
    let mut bytes = [fill; 4];
    bytes[4 - content.len()..].copy_from_slice(content);
    Ok(i32::from_be_bytes(bytes))
}

/// Outcome of one decode attempt.
#[derive(Debug)]
pub enum Decoded {
    Pdu(Pdu),
    /// No complete PDU buffered yet.
    WouldBlock,
    /// Peer closed the stream.
    Closed,
}

/// Errors reported by the wire codec.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed PDU: {0}")]
    Malformed(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The wire layer's per-connection decoder.
pub trait PduSource {
    /// Decode the next complete PDU from buffered input.
    fn decode_next(&mut self) -> Result<Decoded, DecodeError>;
}
