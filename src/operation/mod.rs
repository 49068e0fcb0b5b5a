//! The operation object model.
//!
//! An [`Operation`] is split into a fixed [`OpHeader`], stamped once per
//! request and never cleared, and a recyclable [`OpBody`] that the
//! [`OperationPool`] resets and reuses.

mod arena;
mod cancel;
mod pool;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::connection::AuthInfo;
use crate::error::ResultCode;
use crate::protocol::{Control, MessageId, RequestTag};

pub use arena::{ArenaSpan, OpArena};
pub use cancel::{CancelState, CancelToken};
pub use pool::{OpPoolConfig, OpPoolStats, OperationPool};

/// Identity of one request. Always valid.
#[derive(Debug, Clone)]
pub struct OpHeader {
    pub connid: u64,
    /// Position of this request among those received on the connection.
    pub opid: u64,
    pub msgid: MessageId,
    pub tag: RequestTag,
    pub started: DateTime<Utc>,
    pub started_at: Instant,
    /// Disambiguates operations started within the same second.
    pub tick: u32,
}

/// Typed per-operation storage for backends and overlays.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Extensions {
    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>()).and_then(|b| b.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.map.remove(&TypeId::of::<T>()).and_then(|b| b.downcast::<T>().ok().map(|b| *b))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// Recyclable part of an operation.
#[derive(Debug)]
pub(crate) struct OpBody {
    pub(crate) value: Vec<u8>,
    pub(crate) controls: Vec<Control>,
    /// Connection identity captured when the operation was activated.
    pub(crate) auth: AuthInfo,
    pub(crate) arena: OpArena,
    pub(crate) extensions: Extensions,
    pub(crate) result: Option<ResultCode>,
    pub(crate) entries_sent: u64,
    pub(crate) disconnect: bool,
    pub(crate) persistent: bool,
    /// Identity established by a successful bind, applied on completion.
    pub(crate) new_auth: Option<AuthInfo>,
}

impl OpBody {
    pub(crate) fn new(arena_capacity: usize) -> Self {
        Self {
            value: Vec::new(),
            controls: Vec::new(),
            auth: AuthInfo::default(),
            arena: OpArena::with_capacity(arena_capacity),
            extensions: Extensions::default(),
            result: None,
            entries_sent: 0,
            disconnect: false,
            persistent: false,
            new_auth: None,
        }
    }

    /// Clear every field, keeping allocations.
    pub(crate) fn reset(&mut self) {
        self.value.clear();
        self.controls.clear();
        self.auth.clear();
        self.arena.reset();
        self.extensions.clear();
        self.result = None;
        self.entries_sent = 0;
        self.disconnect = false;
        self.persistent = false;
        self.new_auth = None;
    }
}

/// One LDAP request being processed.
#[derive(Debug)]
pub struct Operation {
    pub header: OpHeader,
    cancel: CancelToken,
    pub(crate) body: OpBody,
}

impl Operation {
    pub(crate) fn new(header: OpHeader, body: OpBody) -> Self {
        Self { header, cancel: CancelToken::new(), body }
    }

    pub fn msgid(&self) -> MessageId {
        self.header.msgid
    }

    pub fn tag(&self) -> RequestTag {
        self.header.tag
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_abandoned(&self) -> bool {
        self.cancel.is_abandoned()
    }

    pub fn request_value(&self) -> &[u8] {
        &self.body.value
    }

    pub fn controls(&self) -> &[Control] {
        &self.body.controls
    }

    /// Identity the operation runs as.
    pub fn auth(&self) -> &AuthInfo {
        &self.body.auth
    }

    pub fn arena(&self) -> &OpArena {
        &self.body.arena
    }

    pub fn arena_mut(&mut self) -> &mut OpArena {
        &mut self.body.arena
    }

    pub fn extensions(&self) -> &Extensions {
        &self.body.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.body.extensions
    }

    /// Result code sent for this operation, if any.
    pub fn result(&self) -> Option<ResultCode> {
        self.body.result
    }

    pub fn entries_sent(&self) -> u64 {
        self.body.entries_sent
    }

    pub fn is_persistent(&self) -> bool {
        self.body.persistent
    }

    pub fn disconnect_requested(&self) -> bool {
        self.body.disconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extensions_typed_access() {
        let mut ext = Extensions::default();
        assert!(ext.insert(7u32).is_none());
        assert_eq!(ext.insert(9u32), Some(7));
        ext.insert(String::from("ctx"));
        assert_eq!(ext.get::<u32>(), Some(&9));
        *ext.get_mut::<String>().unwrap() += "-1";
        assert_eq!(ext.remove::<String>().as_deref(), Some("ctx-1"));
        assert_eq!(ext.len(), 1);
    }

    #[test]
    fn test_body_reset_clears_fields() {
        let mut body = OpBody::new(64);
        body.value.extend_from_slice(b"filter");
        body.controls.push(Control { oid: "1.2.3".into(), critical: true, value: None });
        body.auth.dn.push_str("cn=x");
        body.arena.alloc(b"scratch");
        body.extensions.insert(1u8);
        body.result = Some(ResultCode::Success);
        body.persistent = true;
        body.reset();

        assert!(body.value.is_empty());
        assert!(body.value.capacity() >= 6);
        assert!(body.controls.is_empty());
        assert!(body.auth.is_anonymous());
        assert_eq!(body.arena.used(), 0);
        assert!(body.extensions.is_empty());
        assert_eq!(body.result, None);
        assert!(!body.persistent);
    }
}
