//! In-process backing store.
//!
//! Each offer row sits behind its own async mutex; `lock_offer` holds the
//! owned guard for the rest of the unit, so units touching the same offer
//! serialize while units on different offers proceed in parallel. Writes are
//! staged on the connection and applied at commit while the row locks are
//! still held, so no unit ever observes another unit's uncommitted writes.
//!
//! Lock order: a unit may hold several row locks only if it takes them in
//! ascending `OfferId` order. `deactivate_expired` follows that order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Connection, Connector};
use crate::config::{Credentials, PoolConfig};
use crate::error::StoreError;
use crate::offer::{Offer, OfferId, RedemptionRecord, RequesterId};

type Row = Arc<Mutex<Offer>>;

/// Options fixed at store creation.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreOptions {
    /// When set, connectors must present exactly these credentials.
    pub credentials: Option<Credentials>,
    /// Artificial delay before each store round trip.
    pub latency: Duration,
}

struct Database {
    offers: DashMap<OfferId, Row>,
    redemptions: DashMap<(RequesterId, OfferId), RedemptionRecord>,
    options: MemoryStoreOptions,
    /// Bumped by `break_connections`; connections from older generations are dead.
    generation: AtomicU64,
    failing_connects: AtomicUsize,
    open_connections: AtomicUsize,
    total_connects: AtomicUsize,
}

/// Shared handle to one in-memory database.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Database>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(MemoryStoreOptions::default())
    }

    pub fn with_options(options: MemoryStoreOptions) -> Self {
        Self {
            db: Arc::new(Database {
                offers: DashMap::new(),
                redemptions: DashMap::new(),
                options,
                generation: AtomicU64::new(0),
                failing_connects: AtomicUsize::new(0),
                open_connections: AtomicUsize::new(0),
                total_connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Connector presenting the target and credentials from `config`.
    pub fn connector(&self, config: &PoolConfig) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
            target: config.connect_target.clone(),
            credentials: config.credentials.clone(),
        }
    }

    /// Connections currently open (connected and not yet dropped).
    pub fn open_connections(&self) -> usize {
        self.db.open_connections.load(Ordering::Acquire)
    }

    /// Connections ever opened.
    pub fn total_connects(&self) -> usize {
        self.db.total_connects.load(Ordering::Acquire)
    }

    /// Make the next `n` connection attempts fail with `Unavailable`.
    pub fn fail_next_connects(&self, n: usize) {
        self.db.failing_connects.store(n, Ordering::Release);
    }

    /// Kill every connection opened so far. New connections are unaffected.
    pub fn break_connections(&self) {
        let generation = self.db.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(generation, "Dropping all open store connections");
    }

    /// Store-side view of an offer's committed state, bypassing the pool.
    pub async fn snapshot_offer(&self, id: OfferId) -> Option<Offer> {
        let row = self.db.offers.get(&id).map(|r| Arc::clone(r.value()))?;
        let offer = row.lock().await.clone();
        Some(offer)
    }

    /// Number of active redemption records for an offer.
    pub fn active_redemptions(&self, offer_id: OfferId) -> usize {
        self.db
            .redemptions
            .iter()
            .filter(|r| r.offer_id == offer_id && r.active)
            .count()
    }
}

/// Opens [`MemoryConnection`]s on behalf of a pool.
pub struct MemoryConnector {
    store: MemoryStore,
    target: String,
    credentials: Credentials,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        let db = &self.store.db;
        if db
            .failing_connects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable(format!(
                "{} refused the connection",
                self.target
            )));
        }
        if let Some(required) = &db.options.credentials
            && *required != self.credentials
        {
            return Err(StoreError::InvalidCredentials(self.target.clone()));
        }

        db.open_connections.fetch_add(1, Ordering::AcqRel);
        db.total_connects.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryConnection {
            db: Arc::clone(db),
            generation: db.generation.load(Ordering::Acquire),
            unit: None,
        })
    }

    fn target(&self) -> &str {
        &self.target
    }
}

#[derive(Default)]
struct Unit {
    locked: BTreeMap<OfferId, OwnedMutexGuard<Offer>>,
    remaining: HashMap<OfferId, u32>,
    records: Vec<RedemptionRecord>,
}

/// A connection to a [`MemoryStore`].
pub struct MemoryConnection {
    db: Arc<Database>,
    generation: u64,
    unit: Option<Unit>,
}

impl MemoryConnection {
    /// Fails with `ConnectionLost` once the store killed this connection.
    /// A dead connection's unit is discarded, releasing its row locks.
    fn ensure_alive(&mut self) -> Result<(), StoreError> {
        if self.is_valid() {
            Ok(())
        } else {
            self.unit = None;
            Err(StoreError::ConnectionLost)
        }
    }

    fn ensure_no_unit(&self) -> Result<(), StoreError> {
        if self.unit.is_some() {
            Err(StoreError::UnitInProgress)
        } else {
            Ok(())
        }
    }

    fn unit_mut(&mut self) -> Result<&mut Unit, StoreError> {
        self.unit.as_mut().ok_or(StoreError::NoUnit)
    }

    async fn round_trip(&self) {
        let latency = self.db.options.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn row(&self, id: OfferId) -> Option<Row> {
        self.db.offers.get(&id).map(|r| Arc::clone(r.value()))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.db.open_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_valid(&self) -> bool {
        self.generation == self.db.generation.load(Ordering::Acquire)
    }

    fn in_unit(&self) -> bool {
        self.unit.is_some()
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.ensure_alive()?;
        self.ensure_no_unit()?;
        self.unit = Some(Unit::default());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_alive()?;
        let Unit {
            mut locked,
            remaining,
            records,
        } = self.unit.take().ok_or(StoreError::NoUnit)?;

        self.round_trip().await;
        // Dying mid-commit applies nothing; the staged writes are dropped.
        if !self.is_valid() {
            return Err(StoreError::ConnectionLost);
        }

        for (id, row) in locked.iter_mut() {
            if let Some(quantity) = remaining.get(id) {
                row.remaining_quantity = *quantity;
            }
        }
        for record in records {
            self.db
                .redemptions
                .insert((record.requester_id, record.offer_id), record);
        }
        drop(locked);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.unit = None;
        self.ensure_alive()
    }

    async fn lock_offer(&mut self, id: OfferId) -> Result<Option<Offer>, StoreError> {
        self.ensure_alive()?;
        let unit = self.unit.as_ref().ok_or(StoreError::NoUnit)?;
        if let Some(row) = unit.locked.get(&id) {
            let mut offer = (**row).clone();
            if let Some(quantity) = unit.remaining.get(&id) {
                offer.remaining_quantity = *quantity;
            }
            return Ok(Some(offer));
        }

        let Some(row) = self.row(id) else {
            return Ok(None);
        };
        self.round_trip().await;
        let guard = row.lock_owned().await;
        self.ensure_alive()?;

        let offer = (*guard).clone();
        self.unit_mut()?.locked.insert(id, guard);
        Ok(Some(offer))
    }

    async fn has_redemption(
        &mut self,
        requester_id: RequesterId,
        offer_id: OfferId,
    ) -> Result<bool, StoreError> {
        self.ensure_alive()?;
        let staged = self
            .unit
            .as_ref()
            .ok_or(StoreError::NoUnit)?
            .records
            .iter()
            .any(|r| r.requester_id == requester_id && r.offer_id == offer_id);
        if staged {
            return Ok(true);
        }

        self.round_trip().await;
        self.ensure_alive()?;
        Ok(self
            .db
            .redemptions
            .get(&(requester_id, offer_id))
            .is_some_and(|r| r.active))
    }

    async fn insert_redemption(&mut self, record: RedemptionRecord) -> Result<(), StoreError> {
        self.ensure_alive()?;
        let key = (record.requester_id, record.offer_id);
        let committed = self.db.redemptions.get(&key).is_some_and(|r| r.active);
        let unit = self.unit_mut()?;
        let staged = unit
            .records
            .iter()
            .any(|r| (r.requester_id, r.offer_id) == key);
        if committed || staged {
            return Err(StoreError::Conflict(format!(
                "requester {} already redeemed offer {}",
                record.requester_id, record.offer_id
            )));
        }
        unit.records.push(record);
        Ok(())
    }

    async fn set_remaining(&mut self, id: OfferId, remaining: u32) -> Result<(), StoreError> {
        self.ensure_alive()?;
        let unit = self.unit_mut()?;
        if !unit.locked.contains_key(&id) {
            return Err(StoreError::Conflict(format!(
                "offer {id} is not locked by this unit"
            )));
        }
        unit.remaining.insert(id, remaining);
        Ok(())
    }

    async fn insert_offer(&mut self, offer: Offer) -> Result<(), StoreError> {
        self.ensure_alive()?;
        self.ensure_no_unit()?;
        self.round_trip().await;
        self.ensure_alive()?;
        match self.db.offers.entry(offer.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "offer {} already exists",
                offer.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(offer)));
                Ok(())
            }
        }
    }

    async fn fetch_offer(&mut self, id: OfferId) -> Result<Option<Offer>, StoreError> {
        self.ensure_alive()?;
        // Reading inside a unit could wait on a row lock this unit holds.
        self.ensure_no_unit()?;
        let Some(row) = self.row(id) else {
            return Ok(None);
        };
        self.round_trip().await;
        let offer = row.lock().await.clone();
        self.ensure_alive()?;
        Ok(Some(offer))
    }

    async fn deactivate_expired(&mut self, as_of: NaiveDate) -> Result<usize, StoreError> {
        self.ensure_alive()?;
        self.ensure_no_unit()?;

        let mut rows: Vec<(OfferId, Row)> = self
            .db
            .offers
            .iter()
            .map(|r| (*r.key(), Arc::clone(r.value())))
            .collect();
        rows.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(rows.len());
        for (id, row) in rows {
            guards.push((id, row.lock_owned().await));
        }
        self.round_trip().await;
        self.ensure_alive()?;

        let mut expired = HashSet::new();
        for (id, offer) in guards.iter_mut() {
            if offer.active && offer.is_expired(as_of) {
                offer.active = false;
                expired.insert(*id);
            }
        }
        if !expired.is_empty() {
            for mut record in self.db.redemptions.iter_mut() {
                if expired.contains(&record.offer_id) {
                    record.active = false;
                }
            }
        }
        drop(guards);
        Ok(expired.len())
    }
}
