//! Atomic redemption of offers.
//!
//! One redemption is one store unit on one leased handle:
//! lock the offer row, check the requester's history, check stock, then
//! write the record and the decremented quantity together. Concurrent
//! attempts on the same offer serialize on the row lock, so the checks and
//! the writes always see the same state.

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, StoreError};
use crate::offer::{Offer, OfferId, RedemptionRecord, RequesterId};
use crate::pool::{ConnectionPool, Lease};
use crate::store::{Connection, Connector};

/// Result of a redemption attempt. Business outcomes, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeemOutcome {
    Redeemed,
    AlreadyRedeemed,
    OutOfStock,
    NotFound,
}

impl RedeemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedeemOutcome::Redeemed => "redeemed",
            RedeemOutcome::AlreadyRedeemed => "already_redeemed",
            RedeemOutcome::OutOfStock => "out_of_stock",
            RedeemOutcome::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for RedeemOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RedeemError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl RedeemError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RedeemError::Pool(e) => e.is_retryable(),
            RedeemError::StoreUnavailable(e) => e.is_connection_failure(),
        }
    }
}

/// Redeems offers through a shared [`ConnectionPool`].
pub struct RedemptionCoordinator<K: Connector> {
    pool: ConnectionPool<K>,
}

impl<K: Connector> Clone for RedemptionCoordinator<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<K: Connector> RedemptionCoordinator<K> {
    pub fn new(pool: ConnectionPool<K>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    /// Redeem one unit of `offer_id` for `requester_id`.
    ///
    /// Outcomes are checked in order: missing offer, existing active
    /// redemption for the pair, then stock. The lease goes back to the pool
    /// on every path.
    pub async fn attempt_redeem(
        &self,
        offer_id: OfferId,
        requester_id: RequesterId,
    ) -> Result<RedeemOutcome, RedeemError> {
        let mut lease = self.pool.acquire().await?;
        let result = match lease.connection() {
            Ok(conn) => redeem_once(conn, offer_id, requester_id)
                .await
                .map_err(RedeemError::StoreUnavailable),
            Err(e) => Err(RedeemError::Pool(e)),
        };
        let result = self.finish(lease, result).await;

        match &result {
            Ok(outcome) => tracing::debug!(
                offer = %offer_id,
                requester = %requester_id,
                outcome = %outcome,
                "Redemption attempt finished"
            ),
            Err(e) => tracing::warn!(
                offer = %offer_id,
                requester = %requester_id,
                error = %e,
                retryable = e.is_retryable(),
                "Redemption attempt failed"
            ),
        }
        result
    }

    /// Store a new offer.
    pub async fn publish_offer(&self, offer: Offer) -> Result<OfferId, RedeemError> {
        let id = offer.id;
        let mut lease = self.pool.acquire().await?;
        let result = match lease.connection() {
            Ok(conn) => conn
                .insert_offer(offer)
                .await
                .map_err(RedeemError::StoreUnavailable),
            Err(e) => Err(RedeemError::Pool(e)),
        };
        self.finish(lease, result).await?;
        tracing::info!(offer = %id, "Offer published");
        Ok(id)
    }

    /// Last committed state of an offer.
    pub async fn offer(&self, id: OfferId) -> Result<Option<Offer>, RedeemError> {
        let mut lease = self.pool.acquire().await?;
        let result = match lease.connection() {
            Ok(conn) => conn
                .fetch_offer(id)
                .await
                .map_err(RedeemError::StoreUnavailable),
            Err(e) => Err(RedeemError::Pool(e)),
        };
        self.finish(lease, result).await
    }

    async fn finish<T>(
        &self,
        mut lease: Lease<K>,
        result: Result<T, RedeemError>,
    ) -> Result<T, RedeemError> {
        if let Err(RedeemError::StoreUnavailable(e)) = &result
            && e.is_connection_failure()
        {
            lease.mark_broken();
        }
        // The store call already ended; a release failure must not mask it.
        if let Err(e) = self.pool.release(lease).await {
            tracing::error!(error = %e, "Failed to release handle after store call");
        }
        result
    }
}

/// Run one redemption unit, rolling back on any failure.
async fn redeem_once<C: Connection>(
    conn: &mut C,
    offer_id: OfferId,
    requester_id: RequesterId,
) -> Result<RedeemOutcome, StoreError> {
    conn.begin().await?;
    let result = claim(conn, offer_id, requester_id).await;
    if result.is_err()
        && let Err(rollback_err) = conn.rollback().await
    {
        tracing::debug!(error = %rollback_err, "Rollback after failed redemption also failed");
    }
    result
}

async fn claim<C: Connection>(
    conn: &mut C,
    offer_id: OfferId,
    requester_id: RequesterId,
) -> Result<RedeemOutcome, StoreError> {
    let Some(offer) = conn.lock_offer(offer_id).await? else {
        conn.rollback().await?;
        return Ok(RedeemOutcome::NotFound);
    };
    if conn.has_redemption(requester_id, offer_id).await? {
        conn.rollback().await?;
        return Ok(RedeemOutcome::AlreadyRedeemed);
    }
    let Some(remaining) = offer
        .remaining_quantity
        .checked_sub(1)
        .filter(|_| offer.active)
    else {
        conn.rollback().await?;
        return Ok(RedeemOutcome::OutOfStock);
    };

    conn.insert_redemption(RedemptionRecord::new(requester_id, offer_id))
        .await?;
    conn.set_remaining(offer_id, remaining).await?;
    conn.commit().await?;
    Ok(RedeemOutcome::Redeemed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::store::memory::{MemoryConnector, MemoryStore};
    use chrono::NaiveDate;
    use std::num::NonZeroUsize;

    async fn coordinator(
        store: &MemoryStore,
        capacity: usize,
    ) -> RedemptionCoordinator<MemoryConnector> {
        let config = PoolConfig::default().with_capacity(NonZeroUsize::new(capacity).unwrap());
        let pool = ConnectionPool::connect(store.connector(&config), config)
            .await
            .unwrap();
        RedemptionCoordinator::new(pool)
    }

    fn offer(quantity: u32) -> Offer {
        Offer::new(
            "Half-price ramen",
            quantity,
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
        )
    }

    #[test]
    fn outcomes_serialize_in_snake_case() {
        insta::assert_json_snapshot!(
            [
                RedeemOutcome::Redeemed,
                RedeemOutcome::AlreadyRedeemed,
                RedeemOutcome::OutOfStock,
                RedeemOutcome::NotFound,
            ],
            @r#"
        [
          "redeemed",
          "already_redeemed",
          "out_of_stock",
          "not_found"
        ]
        "#
        );
        assert_eq!(RedeemOutcome::OutOfStock.to_string(), "out_of_stock");
    }

    #[tokio::test]
    async fn redeem_decrements_and_records() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store, 2).await;
        let id = coordinator.publish_offer(offer(3)).await.unwrap();

        let outcome = coordinator
            .attempt_redeem(id, RequesterId::new())
            .await
            .unwrap();

        assert_eq!(outcome, RedeemOutcome::Redeemed);
        let stored = coordinator.offer(id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_quantity, 2);
        assert_eq!(store.active_redemptions(id), 1);
        assert_eq!(coordinator.pool().status().free, 2);
    }

    #[tokio::test]
    async fn unknown_offer_is_not_found() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store, 1).await;

        let outcome = coordinator
            .attempt_redeem(OfferId::new(), RequesterId::new())
            .await
            .unwrap();
        assert_eq!(outcome, RedeemOutcome::NotFound);
    }

    #[tokio::test]
    async fn same_requester_redeems_once() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store, 1).await;
        let id = coordinator.publish_offer(offer(5)).await.unwrap();
        let requester = RequesterId::new();

        let first = coordinator.attempt_redeem(id, requester).await.unwrap();
        let second = coordinator.attempt_redeem(id, requester).await.unwrap();

        assert_eq!(first, RedeemOutcome::Redeemed);
        assert_eq!(second, RedeemOutcome::AlreadyRedeemed);
        let stored = store.snapshot_offer(id).await.unwrap();
        assert_eq!(stored.remaining_quantity, 4);
    }

    #[tokio::test]
    async fn empty_or_inactive_offer_is_out_of_stock() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store, 1).await;
        let empty = coordinator.publish_offer(offer(0)).await.unwrap();
        let mut inactive = offer(10);
        inactive.active = false;
        let inactive = coordinator.publish_offer(inactive).await.unwrap();

        for id in [empty, inactive] {
            let outcome = coordinator
                .attempt_redeem(id, RequesterId::new())
                .await
                .unwrap();
            assert_eq!(outcome, RedeemOutcome::OutOfStock);
            assert_eq!(store.active_redemptions(id), 0);
        }
        let stored = store.snapshot_offer(inactive).await.unwrap();
        assert_eq!(stored.remaining_quantity, 10);
    }

    #[tokio::test]
    async fn closed_pool_is_a_pool_error() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store, 1).await;
        coordinator.pool().shutdown().await;

        let err = coordinator
            .attempt_redeem(OfferId::new(), RequesterId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RedeemError::Pool(PoolError::Closed)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn lost_connection_is_retryable_and_replaced() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store, 1).await;
        let id = coordinator.publish_offer(offer(1)).await.unwrap();

        store.break_connections();
        let err = coordinator
            .attempt_redeem(id, RequesterId::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RedeemError::StoreUnavailable(StoreError::ConnectionLost)
        ));
        assert!(err.is_retryable());

        // Nothing was written and the pool already holds a fresh handle
        assert_eq!(store.snapshot_offer(id).await.unwrap().remaining_quantity, 1);
        assert_eq!(coordinator.pool().status().free, 1);
        let outcome = coordinator
            .attempt_redeem(id, RequesterId::new())
            .await
            .unwrap();
        assert_eq!(outcome, RedeemOutcome::Redeemed);
    }

    #[tokio::test]
    async fn failed_release_keeps_the_committed_outcome() {
        let store = MemoryStore::new();
        let elsewhere = coordinator(&store, 1).await;
        let coordinator = coordinator(&store, 1).await;
        let foreign = elsewhere.pool().acquire().await.unwrap();

        let result = coordinator.finish(foreign, Ok(RedeemOutcome::Redeemed)).await;

        assert_eq!(result.unwrap(), RedeemOutcome::Redeemed);
        assert_eq!(coordinator.pool().status().free, 1);
        // The rejected lease went back to the pool that issued it
        assert_eq!(elsewhere.pool().status().free, 1);
        assert_eq!(elsewhere.pool().status().leased, 0);
    }
}
