//! Exclusive ownership of one pooled handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::connection_pool::PoolShared;
use super::{HandleId, Slot};
use crate::error::PoolError;
use crate::store::{Connection, Connector};

/// A handle checked out of a [`ConnectionPool`](super::ConnectionPool).
///
/// Give it back with `ConnectionPool::release`. Dropping it returns it too,
/// but a broken connection can only be replaced lazily on that path.
pub struct Lease<K: Connector> {
    id: HandleId,
    conn: Option<K::Connection>,
    broken: bool,
    /// The leased connection was discarded; the slot returns under a fresh id.
    replaced: bool,
    /// Set by shutdown once the grace period ran out.
    revoked: Arc<AtomicBool>,
    /// `None` once the lease has been checked in.
    pool: Option<Arc<PoolShared<K>>>,
}

impl<K: Connector> Lease<K> {
    pub(crate) fn new(
        pool: Arc<PoolShared<K>>,
        slot: Slot<K::Connection>,
        revoked: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: slot.id,
            conn: slot.conn,
            broken: false,
            replaced: false,
            revoked,
            pool: Some(pool),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The leased connection.
    ///
    /// Fails with `Closed` once the pool revoked the lease during shutdown,
    /// and with `HandleBroken` after [`mark_broken`](Self::mark_broken).
    pub fn connection(&mut self) -> Result<&mut K::Connection, PoolError> {
        if self.is_revoked() {
            return Err(PoolError::Closed);
        }
        if self.broken {
            return Err(PoolError::HandleBroken(self.id));
        }
        self.conn.as_mut().ok_or(PoolError::HandleBroken(self.id))
    }

    /// Flag the connection as dead. The pool discards it on release.
    pub fn mark_broken(&mut self) {
        if !self.broken {
            tracing::warn!(handle = %self.id, "Handle marked broken");
            self.broken = true;
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub(crate) fn is_vacant(&self) -> bool {
        self.conn.is_none()
    }

    /// Broken by the holder, failing the store's liveness check, or still
    /// inside a unit its holder abandoned.
    pub(crate) fn needs_replacement(&self) -> bool {
        self.broken || self.conn.as_ref().is_none_or(|conn| !conn.is_valid() || conn.in_unit())
    }

    pub(crate) fn discard_connection(&mut self) {
        self.conn = None;
        self.broken = false;
        self.replaced = true;
    }

    pub(crate) fn install(&mut self, conn: K::Connection) {
        self.conn = Some(conn);
        self.broken = false;
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared<K>>) -> bool {
        self.pool.as_ref().is_some_and(|p| Arc::ptr_eq(p, pool))
    }

    /// Take the slot back without checking it in. Only for the pool, while
    /// it holds its state lock and is undoing a hand-off nobody received.
    pub(crate) fn into_slot_unchecked(mut self) -> Slot<K::Connection> {
        self.pool = None;
        Slot {
            id: self.id,
            conn: self.conn.take(),
        }
    }

    pub(crate) fn check_in(mut self) -> Result<(), PoolError> {
        match self.take_return() {
            Some((pool, leased_id, slot)) => pool.check_in(leased_id, slot),
            None => Ok(()),
        }
    }

    fn take_return(&mut self) -> Option<(Arc<PoolShared<K>>, HandleId, Slot<K::Connection>)> {
        let pool = self.pool.take()?;
        if self.conn.is_some() && self.needs_replacement() {
            tracing::warn!(
                handle = %self.id,
                "Discarding broken handle, slot will reconnect on next acquire"
            );
            self.discard_connection();
        }
        let slot_id = if self.replaced {
            HandleId::new()
        } else {
            self.id
        };
        Some((
            pool,
            self.id,
            Slot {
                id: slot_id,
                conn: self.conn.take(),
            },
        ))
    }
}

impl<K: Connector> Drop for Lease<K> {
    fn drop(&mut self) {
        if let Some((pool, leased_id, slot)) = self.take_return() {
            tracing::debug!(handle = %leased_id, "Lease dropped without release, returning handle");
            // check_in logs invariant violations itself
            let _ = pool.check_in(leased_id, slot);
        }
    }
}

impl<K: Connector> std::fmt::Debug for Lease<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .field("vacant", &self.conn.is_none())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
