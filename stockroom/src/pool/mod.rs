//! Bounded pool of backing-store connections.
//!
//! Every handle is in exactly one of two places:
//! - free: owned by the pool, queued in the free list
//! - leased: owned by exactly one [`Lease`], tracked in the leased set
//!
//! A release hands the handle straight to the longest-waiting acquirer when
//! there is one, so waiters are served in arrival order and a burst of new
//! acquirers cannot starve them.
//!
//! Broken handles never go back to the free list. A release replaces them
//! with a fresh connection; when that connect fails (or the lease was simply
//! dropped) a vacant slot is queued instead and the next acquirer connects it.

mod connection_pool;
mod lease;

pub use connection_pool::ConnectionPool;
pub use lease::Lease;

/// Identity of one pooled handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct HandleId(uuid::Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle as the pool stores it. `conn` is `None` for a vacant slot
/// waiting to be reconnected.
pub(crate) struct Slot<C> {
    pub(crate) id: HandleId,
    pub(crate) conn: Option<C>,
}
