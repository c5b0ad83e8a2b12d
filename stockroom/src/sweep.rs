//! Deactivation of expired offers.

use chrono::NaiveDate;

use crate::error::{PoolError, StoreError};
use crate::pool::ConnectionPool;
use crate::store::{Connection, Connector};

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Expiration sweep failed: {0}")]
    Store(#[source] StoreError),
}

/// Deactivates offers past their end date, and their redemption records.
///
/// Scheduling is up to the caller. A sweep takes the same per-offer row
/// locks as redemption, so running it alongside `attempt_redeem` is safe.
pub struct ExpirationSweeper<K: Connector> {
    pool: ConnectionPool<K>,
}

impl<K: Connector> Clone for ExpirationSweeper<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<K: Connector> ExpirationSweeper<K> {
    pub fn new(pool: ConnectionPool<K>) -> Self {
        Self { pool }
    }

    /// Deactivate every active offer whose `end_date` is before `as_of`.
    /// Returns how many offers were deactivated by this call.
    pub async fn deactivate_expired(&self, as_of: NaiveDate) -> Result<usize, SweepError> {
        let mut lease = self.pool.acquire().await?;
        let result = match lease.connection() {
            Ok(conn) => conn.deactivate_expired(as_of).await.map_err(SweepError::Store),
            Err(e) => Err(SweepError::Pool(e)),
        };
        if let Err(SweepError::Store(e)) = &result
            && e.is_connection_failure()
        {
            lease.mark_broken();
        }
        if let Err(e) = self.pool.release(lease).await {
            tracing::error!(error = %e, "Failed to release handle after sweep");
        }

        match &result {
            Ok(0) => tracing::debug!(%as_of, "No expired offers"),
            Ok(deactivated) => tracing::info!(%as_of, deactivated, "Deactivated expired offers"),
            Err(e) => tracing::warn!(%as_of, error = %e, "Expiration sweep failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::offer::{Offer, RequesterId};
    use crate::redemption::{RedeemOutcome, RedemptionCoordinator};
    use crate::store::memory::MemoryStore;
    use std::num::NonZeroUsize;

    fn date(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, month, day).unwrap()
    }

    #[tokio::test]
    async fn expired_offers_and_their_redemptions_are_deactivated() {
        let store = MemoryStore::new();
        let config = PoolConfig::default().with_capacity(NonZeroUsize::new(2).unwrap());
        let pool = ConnectionPool::connect(store.connector(&config), config)
            .await
            .unwrap();
        let coordinator = RedemptionCoordinator::new(pool.clone());
        let sweeper = ExpirationSweeper::new(pool.clone());

        let expiring = coordinator
            .publish_offer(Offer::new("Spring spa day", 5, date(3, 1), date(3, 31)))
            .await
            .unwrap();
        let current = coordinator
            .publish_offer(Offer::new("Summer tour", 5, date(6, 1), date(8, 31)))
            .await
            .unwrap();
        coordinator
            .attempt_redeem(expiring, RequesterId::new())
            .await
            .unwrap();

        // End date itself is still valid
        assert_eq!(sweeper.deactivate_expired(date(3, 31)).await.unwrap(), 0);
        assert_eq!(sweeper.deactivate_expired(date(4, 1)).await.unwrap(), 1);
        assert_eq!(sweeper.deactivate_expired(date(4, 1)).await.unwrap(), 0);

        assert!(!store.snapshot_offer(expiring).await.unwrap().active);
        assert!(store.snapshot_offer(current).await.unwrap().active);
        assert_eq!(store.active_redemptions(expiring), 0);

        let outcome = coordinator
            .attempt_redeem(expiring, RequesterId::new())
            .await
            .unwrap();
        assert_eq!(outcome, RedeemOutcome::OutOfStock);
        assert_eq!(pool.status().free, 2);
    }

    #[tokio::test]
    async fn sweep_on_closed_pool_fails() {
        let store = MemoryStore::new();
        let config = PoolConfig::default();
        let pool = ConnectionPool::connect(store.connector(&config), config)
            .await
            .unwrap();
        pool.shutdown().await;

        let err = ExpirationSweeper::new(pool)
            .deactivate_expired(date(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Pool(PoolError::Closed)));
    }
}
