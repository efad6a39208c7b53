//! Strongly-typed identifiers for lumen

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Identifier of one accepted client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(i32);

impl ConnectionId {
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic source of connection ids.
///
/// Each registry owns one allocator; ids are unique for the allocator's
/// lifetime and never reused.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicI32,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    /// Mint the next id
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
