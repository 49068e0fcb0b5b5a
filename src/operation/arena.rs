//! Per-operation scratch arena.
//!
//! A bump allocator over one owned buffer. Allocations are addressed by
//! [`ArenaSpan`] instead of pointers, so nothing can outlive a `reset`.
//! The buffer never grows past its capacity; when it is exhausted the
//! caller falls back to ordinary heap allocation.

/// Location of an allocation inside an [`OpArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSpan {
    start: u32,
    len: u32,
}

impl ArenaSpan {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-capacity bump arena, reset between operations.
#[derive(Debug, Default)]
pub struct OpArena {
    buf: Vec<u8>,
    capacity: usize,
    high_water: usize,
}

impl OpArena {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self { buf: Vec::with_capacity(capacity), capacity, high_water: 0 }
    }

    /// Copy `bytes` into the arena. `None` once the arena is exhausted.
    pub fn alloc(&mut self, bytes: &[u8]) -> Option<ArenaSpan> {
        let start = self.buf.len();
        if bytes.len() > self.capacity - start {
            return None;
        }
        self.buf.extend_from_slice(bytes);
        self.high_water = self.high_water.max(self.buf.len());
        Some(ArenaSpan { start: start as u32, len: bytes.len() as u32 })
    }

    pub fn alloc_str(&mut self, s: &str) -> Option<ArenaSpan> {
        self.alloc(s.as_bytes())
    }

    /// Bytes of an allocation. Empty if the span predates the last reset.
    pub fn get(&self, span: ArenaSpan) -> &[u8] {
        let start = span.start as usize;
        let end = start + span.len as usize;
        self.buf.get(start..end).unwrap_or(&[])
    }

    pub fn get_str(&self, span: ArenaSpan) -> Option<&str> {
        std::str::from_utf8(self.get(span)).ok()
    }

    /// Drop every allocation, keeping the buffer.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest footprint seen since the arena was created.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_get() {
        let mut arena = OpArena::with_capacity(32);
        let a = arena.alloc_str("cn=admin").unwrap();
        let b = arena.alloc(b"\x01\x02").unwrap();
        assert_eq!(arena.get_str(a), Some("cn=admin"));
        assert_eq!(arena.get(b), b"\x01\x02");
        assert_eq!(arena.used(), 10);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut arena = OpArena::with_capacity(4);
        assert!(arena.alloc(b"abcd").is_some());
        assert!(arena.alloc(b"e").is_none());
        assert!(arena.alloc(b"").is_some());
    }

    #[test]
    fn test_reset_invalidates_spans() {
        let mut arena = OpArena::with_capacity(16);
        let span = arena.alloc(b"0123456789").unwrap();
        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.get(span), b"");
        assert_eq!(arena.high_water(), 10);
    }
}
