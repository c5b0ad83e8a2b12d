//! Pool bookkeeping: free list, leased set, parked acquirers, shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};

use super::lease::Lease;
use super::{HandleId, Slot};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::status::PoolStatus;
use crate::store::Connector;

pub(crate) struct PoolState<K: Connector> {
    free: VecDeque<Slot<K::Connection>>,
    /// Revocation flag of every outstanding lease, by the id it was leased under.
    leased: HashMap<HandleId, Arc<AtomicBool>>,
    /// Parked acquirers, oldest first. A closed sender belongs to an
    /// acquirer that gave up and is skipped on hand-off.
    waiters: VecDeque<oneshot::Sender<Lease<K>>>,
    closed: bool,
}

pub(crate) struct PoolShared<K: Connector> {
    pub(crate) connector: K,
    config: PoolConfig,
    state: Mutex<PoolState<K>>,
    /// Signalled when the last lease comes back after shutdown.
    drained: Notify,
}

impl<K: Connector> PoolShared<K> {
    /// Never held across an await.
    fn lock_state(&self) -> MutexGuard<'_, PoolState<K>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pool state mutex poisoned, continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn lease(self: &Arc<Self>, state: &mut PoolState<K>, slot: Slot<K::Connection>) -> Lease<K> {
        let revoked = Arc::new(AtomicBool::new(false));
        state.leased.insert(slot.id, Arc::clone(&revoked));
        Lease::new(Arc::clone(self), slot, revoked)
    }

    /// Give `slot` to the oldest live waiter, or put it on the free list.
    fn hand_off(self: &Arc<Self>, state: &mut PoolState<K>, mut slot: Slot<K::Connection>) {
        while let Some(waiter) = state.waiters.pop_front() {
            let lease = self.lease(state, slot);
            match waiter.send(lease) {
                Ok(()) => return,
                Err(unclaimed) => {
                    // acquirer timed out or was cancelled
                    slot = unclaimed.into_slot_unchecked();
                    state.leased.remove(&slot.id);
                }
            }
        }
        state.free.push_back(slot);
    }

    /// Return a leased handle. `leased_id` is the id it was leased under;
    /// `slot.id` differs when the connection was replaced.
    pub(crate) fn check_in(
        self: &Arc<Self>,
        leased_id: HandleId,
        slot: Slot<K::Connection>,
    ) -> Result<(), PoolError> {
        let disposed = {
            let mut state = self.lock_state();
            if state.leased.remove(&leased_id).is_none() {
                tracing::error!(handle = %leased_id, "Bug: checked in a handle that is not leased");
                return Err(PoolError::NotLeased(leased_id));
            }
            if state.closed {
                if state.leased.is_empty() {
                    self.drained.notify_waiters();
                }
                Some(slot)
            } else {
                self.hand_off(&mut state, slot);
                None
            }
        };

        // Close outside the lock
        if let Some(slot) = disposed {
            tracing::debug!(handle = %slot.id, "Closing handle returned after shutdown");
            drop(slot);
        }
        Ok(())
    }
}

enum Checkout<K: Connector> {
    Ready(Lease<K>),
    Parked(oneshot::Receiver<Lease<K>>),
}

/// Fixed-capacity pool of store connections.
///
/// Cloning is cheap and every clone refers to the same pool.
pub struct ConnectionPool<K: Connector> {
    shared: Arc<PoolShared<K>>,
}

impl<K: Connector> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Connector> std::fmt::Debug for ConnectionPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

impl<K: Connector> ConnectionPool<K> {
    /// Open `config.capacity` connections up front.
    ///
    /// Construction is all or nothing: if any connect fails the handles
    /// already opened are closed and no pool is returned.
    pub async fn connect(connector: K, config: PoolConfig) -> Result<Self, PoolError> {
        let capacity = config.capacity();
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            match connector.connect().await {
                Ok(conn) => free.push_back(Slot {
                    id: HandleId::new(),
                    conn: Some(conn),
                }),
                Err(e) => {
                    tracing::error!(
                        store = %connector.target(),
                        opened = free.len(),
                        capacity,
                        error = %e,
                        "Failed to fill connection pool"
                    );
                    return Err(PoolError::Connect(e));
                }
            }
        }

        tracing::info!(store = %connector.target(), capacity, "Connection pool ready");
        Ok(Self {
            shared: Arc::new(PoolShared {
                connector,
                config,
                state: Mutex::new(PoolState {
                    free,
                    leased: HashMap::with_capacity(capacity),
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                drained: Notify::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.capacity()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    /// Lease a handle, waiting for one if all are out.
    ///
    /// Waits at most `acquire_timeout_ms` when the config sets one.
    pub async fn acquire(&self) -> Result<Lease<K>, PoolError> {
        match self.shared.config.acquire_timeout() {
            Some(timeout) => self.acquire_timeout(timeout).await,
            None => self.acquire_inner().await,
        }
    }

    /// Lease a handle, giving up with `Exhausted` after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease<K>, PoolError> {
        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(waited = ?timeout, "Timed out waiting for a free handle");
                Err(PoolError::Exhausted { waited: timeout })
            }
        }
    }

    /// Lease a connected handle if one is free right now.
    pub fn try_acquire(&self) -> Option<Lease<K>> {
        let mut state = self.shared.lock_state();
        if state.closed {
            return None;
        }
        let pos = state.free.iter().position(|slot| slot.conn.is_some())?;
        let slot = state.free.remove(pos)?;
        Some(self.shared.lease(&mut state, slot))
    }

    async fn acquire_inner(&self) -> Result<Lease<K>, PoolError> {
        let checkout = {
            let mut state = self.shared.lock_state();
            if state.closed {
                return Err(PoolError::Closed);
            }
            match state.free.pop_front() {
                Some(slot) => Checkout::Ready(self.shared.lease(&mut state, slot)),
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Checkout::Parked(rx)
                }
            }
        };

        let mut lease = match checkout {
            Checkout::Ready(lease) => lease,
            // Sender dropped without a hand-off only happens on shutdown
            Checkout::Parked(rx) => rx.await.map_err(|_| PoolError::Closed)?,
        };

        if lease.is_vacant() {
            match self.shared.connector.connect().await {
                Ok(conn) => {
                    tracing::info!(handle = %lease.id(), "Reconnected vacant slot");
                    lease.install(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        handle = %lease.id(),
                        error = %e,
                        "Failed to reconnect vacant slot"
                    );
                    // Dropping the lease queues the slot again
                    return Err(PoolError::Connect(e));
                }
            }
        }
        Ok(lease)
    }

    /// Return a lease to the pool.
    ///
    /// A broken or dead connection is replaced before the slot goes back.
    /// Releasing a lease this pool did not issue is an invariant violation:
    /// it is logged, reported as `NotLeased`, and the lease goes back to the
    /// pool that issued it.
    pub async fn release(&self, mut lease: Lease<K>) -> Result<(), PoolError> {
        if !lease.belongs_to(&self.shared) {
            tracing::error!(
                handle = %lease.id(),
                "Bug: released a handle leased from another pool"
            );
            return Err(PoolError::NotLeased(lease.id()));
        }

        if lease.needs_replacement() && !self.is_closed() {
            tracing::warn!(handle = %lease.id(), "Replacing broken handle");
            lease.discard_connection();
            match self.shared.connector.connect().await {
                Ok(conn) => lease.install(conn),
                Err(e) => {
                    tracing::warn!(
                        handle = %lease.id(),
                        error = %e,
                        "Replacement connect failed, slot will reconnect on next acquire"
                    );
                }
            }
        }

        lease.check_in()
    }

    /// Stop handing out leases and close every handle.
    ///
    /// Parked acquirers fail with `Closed` immediately. Outstanding leases
    /// get `shutdown_grace_ms` to come back and are closed as they do; any
    /// still out after that are revoked. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let (disposed, waiters, outstanding) = {
            let mut state = self.shared.lock_state();
            if state.closed {
                tracing::debug!("Connection pool already shut down");
                return;
            }
            state.closed = true;
            let disposed: Vec<_> = state.free.drain(..).collect();
            let waiters = std::mem::take(&mut state.waiters);
            (disposed, waiters, state.leased.len())
        };

        let closed = disposed.len();
        drop(disposed);
        drop(waiters);
        tracing::info!(closed, outstanding, "Connection pool shutting down");

        if outstanding > 0 {
            self.await_outstanding().await;
        }
    }

    async fn await_outstanding(&self) {
        let grace = self.shared.config.shutdown_grace();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let empty = self.shared.lock_state().leased.is_empty();
            if empty {
                tracing::info!("All leased handles returned");
                return;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }

        let state = self.shared.lock_state();
        for (id, revoked) in &state.leased {
            revoked.store(true, Ordering::Release);
            tracing::warn!(
                handle = %id,
                grace = ?grace,
                "Revoking handle still leased after shutdown grace period"
            );
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock_state();
        PoolStatus {
            capacity: self.capacity(),
            free: state.free.len(),
            leased: state.leased.len(),
            waiters: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            closed: state.closed,
        }
    }
}
