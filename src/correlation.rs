use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Identifier used to match a response envelope to its request.
///
/// Correlation IDs are carried in-band in every envelope and are only
/// meaningful on the connection that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wrap a raw wire value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw wire value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection source of correlation IDs.
///
/// A monotonically increasing counter starting at 1. A 64-bit counter cannot
/// realistically wrap during one connection, and the pending table rejects a
/// reused id regardless, so uniqueness among pending requests holds.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    // ---
    next: AtomicU64,
}

impl CorrelationIdGenerator {
    /// Create a generator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of one connection endpoint, used to tag log lines and to tell
/// apart successive connections from the same peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Mint a fresh random connection id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        // ---
        let ids = CorrelationIdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert_eq!(first.get(), 1);
        assert!(second > first);
    }

    #[test]
    fn test_connection_ids_differ() {
        // ---
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 8);
    }
}
