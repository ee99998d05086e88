//! Connection identifiers and the thread-safe allocator that issues them.
//!
//! # Why not reuse identifiers?
//!
//! A `ClientId` appears in every log line about a connection.  If an id were
//! handed out again after its connection closed, a late log line (or a late
//! message routed by id) could be attributed to the wrong client.  The
//! allocator therefore only ever moves forward.
//!
//! # Thread safety
//!
//! The allocator uses an `AtomicU64`.  `fetch_add` reads, increments, and
//! writes the value as a single indivisible step, so two threads allocating at
//! the same time can never receive the same id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one websocket connection, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Wraps a raw id.  Mostly useful in tests and log correlation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing [`ClientId`]s, starting at 1.
///
/// # Examples
///
/// ```rust
/// use relay_core::ClientIdAllocator;
///
/// let ids = ClientIdAllocator::new();
/// assert_eq!(ids.allocate().get(), 1);
/// assert_eq!(ids.allocate().get(), 2);
/// ```
#[derive(Debug)]
pub struct ClientIdAllocator {
    next: AtomicU64,
}

impl ClientIdAllocator {
    /// Creates an allocator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns a fresh id.
    ///
    /// `Ordering::Relaxed` is enough: the id is only used as a map key and
    /// does not publish any other memory to other threads.
    pub fn allocate(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
