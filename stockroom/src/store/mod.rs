//! Contract the core requires of the backing store.
//!
//! The store is the single source of truth for offers and redemption
//! records, and the only authority for their concurrency control. The core
//! never holds an in-process lock across a store call; it relies on the
//! atomic unit opened by [`Connection::begin`] instead.
//!
//! Operations that take a row lock or stage a write (`lock_offer`,
//! `has_redemption`, `insert_redemption`, `set_remaining`) require an open
//! unit. `insert_offer`, `fetch_offer` and `deactivate_expired` each run as
//! their own atomic unit and fail with [`StoreError::UnitInProgress`] if one
//! is already open.

pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StoreError;
use crate::offer::{Offer, OfferId, RedemptionRecord, RequesterId};

/// Opens connections to the backing store. Owned by the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Address of the store, for logging.
    fn target(&self) -> &str;
}

/// One live connection. Closing happens on drop; an open unit is rolled back.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Cheap, non-blocking liveness check. Run by the pool on release.
    fn is_valid(&self) -> bool;

    /// Whether a unit is open. The pool never recycles a connection that
    /// comes back with one, since its row locks would stay held.
    fn in_unit(&self) -> bool;

    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard staged writes and drop row locks. A no-op without an open unit.
    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Read an offer and hold its exclusive row lock until the unit ends.
    async fn lock_offer(&mut self, id: OfferId) -> Result<Option<Offer>, StoreError>;

    /// Whether an active redemption record exists for the pair.
    async fn has_redemption(
        &mut self,
        requester_id: RequesterId,
        offer_id: OfferId,
    ) -> Result<bool, StoreError>;

    async fn insert_redemption(&mut self, record: RedemptionRecord) -> Result<(), StoreError>;

    /// Stage a new remaining quantity for an offer locked in this unit.
    async fn set_remaining(&mut self, id: OfferId, remaining: u32) -> Result<(), StoreError>;

    async fn insert_offer(&mut self, offer: Offer) -> Result<(), StoreError>;

    /// Read the last committed state of an offer without locking it.
    async fn fetch_offer(&mut self, id: OfferId) -> Result<Option<Offer>, StoreError>;

    /// Deactivate every active offer whose end date is before `as_of`, and
    /// the redemption records attached to them. Returns the number of offers
    /// deactivated.
    async fn deactivate_expired(&mut self, as_of: NaiveDate) -> Result<usize, StoreError>;
}
