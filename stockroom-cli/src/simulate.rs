//! Redemption load simulation.
//!
//! Seeds one offer and races requesters against it through a shared pool,
//! optionally with the expiration sweep running alongside.

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use stockroom::{
    ConnectionPool, Connector, ExpirationSweeper, Offer, OfferCategory, OfferId, PoolConfig,
    PoolError, PoolStatus, RedeemError, RedeemOutcome, RedemptionCoordinator, RequesterId,
};
use tokio::sync::watch;

use crate::args::SimulateArgs;
use crate::sweeper::{SweepSummary, spawn_sweeper};

#[derive(Debug, thiserror::Error)]
pub enum SimulateError {
    #[error("failed to open connection pool: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to seed offer: {0}")]
    Seed(#[source] RedeemError),
    #[error("failed to read back offer: {0}")]
    ReadBack(#[source] RedeemError),
    #[error("offer {0} disappeared during the run")]
    OfferMissing(OfferId),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Tally of attempt results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub redeemed: usize,
    pub already_redeemed: usize,
    pub out_of_stock: usize,
    pub not_found: usize,
    /// Attempts that ended in an error rather than an outcome.
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, result: &Result<RedeemOutcome, RedeemError>) {
        match result {
            Ok(RedeemOutcome::Redeemed) => self.redeemed += 1,
            Ok(RedeemOutcome::AlreadyRedeemed) => self.already_redeemed += 1,
            Ok(RedeemOutcome::OutOfStock) => self.out_of_stock += 1,
            Ok(RedeemOutcome::NotFound) => self.not_found += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: OutcomeCounts) {
        self.redeemed += other.redeemed;
        self.already_redeemed += other.already_redeemed;
        self.out_of_stock += other.out_of_stock;
        self.not_found += other.not_found;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.redeemed + self.already_redeemed + self.out_of_stock + self.not_found + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub offer_id: OfferId,
    pub quantity: u32,
    pub remaining_quantity: u32,
    pub offer_active: bool,
    pub requesters: usize,
    pub attempts_per_requester: usize,
    pub outcomes: OutcomeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepSummary>,
    /// Pool state after shutdown.
    pub pool: PoolStatus,
    pub elapsed_ms: u64,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub async fn run_simulation<K: Connector>(
    connector: K,
    config: PoolConfig,
    args: &SimulateArgs,
) -> Result<SimulationReport, SimulateError> {
    let started = std::time::Instant::now();
    let pool = ConnectionPool::connect(connector, config).await?;
    let coordinator = RedemptionCoordinator::new(pool.clone());

    let start = today();
    let end = start
        .checked_add_days(Days::new(u64::from(args.offer_days)))
        .unwrap_or(NaiveDate::MAX);
    let offer = Offer::new("Simulated offer", args.quantity, start, end)
        .with_category(OfferCategory::ThingsToDo);
    let offer_id = coordinator
        .publish_offer(offer)
        .await
        .map_err(SimulateError::Seed)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = args.sweep_interval.map(|interval| {
        spawn_sweeper(
            ExpirationSweeper::new(pool.clone()),
            interval,
            today,
            shutdown_rx,
        )
    });

    tracing::info!(
        offer = %offer_id,
        quantity = args.quantity,
        requesters = args.requesters,
        attempts = args.attempts,
        capacity = pool.capacity(),
        "Starting simulation"
    );

    let attempts = args.attempts;
    let requesters: Vec<_> = (0..args.requesters)
        .map(|_| {
            let coordinator = coordinator.clone();
            let requester = RequesterId::new();
            tokio::spawn(async move {
                let mut counts = OutcomeCounts::default();
                for _ in 0..attempts {
                    let result = coordinator.attempt_redeem(offer_id, requester).await;
                    counts.record(&result);
                }
                counts
            })
        })
        .collect();

    let mut outcomes = OutcomeCounts::default();
    for counts in futures::future::join_all(requesters).await {
        outcomes.merge(counts?);
    }

    let _ = shutdown_tx.send(true);
    let sweep = match sweep {
        Some(handle) => Some(handle.await?),
        None => None,
    };

    let stored = coordinator
        .offer(offer_id)
        .await
        .map_err(SimulateError::ReadBack)?
        .ok_or(SimulateError::OfferMissing(offer_id))?;

    pool.shutdown().await;

    let report = SimulationReport {
        offer_id,
        quantity: args.quantity,
        remaining_quantity: stored.remaining_quantity,
        offer_active: stored.active,
        requesters: args.requesters,
        attempts_per_requester: args.attempts,
        outcomes,
        sweep,
        pool: pool.status(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    tracing::info!(
        redeemed = report.outcomes.redeemed,
        remaining = report.remaining_quantity,
        elapsed_ms = report.elapsed_ms,
        "Simulation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use stockroom::MemoryStore;

    fn config(capacity: usize) -> PoolConfig {
        PoolConfig::default().with_capacity(NonZeroUsize::new(capacity).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retries_after_success_are_already_redeemed() {
        let store = MemoryStore::new();
        let config = config(2);
        let args = SimulateArgs {
            quantity: 3,
            requesters: 5,
            attempts: 2,
            ..Default::default()
        };

        let report = run_simulation(store.connector(&config), config, &args)
            .await
            .unwrap();

        insta::assert_json_snapshot!(report.outcomes, @r#"
        {
          "redeemed": 3,
          "already_redeemed": 3,
          "out_of_stock": 4,
          "not_found": 0,
          "failed": 0
        }
        "#);
        assert_eq!(report.outcomes.total(), 10);
        assert_eq!(report.remaining_quantity, 0);
        assert!(report.offer_active);
        assert!(report.sweep.is_none());
        assert!(report.pool.closed);
        assert_eq!(report.pool.free + report.pool.leased, 0);
        assert_eq!(store.open_connections(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweeper_runs_alongside_requesters() {
        let store = MemoryStore::new();
        let config = config(3);
        let args = SimulateArgs {
            quantity: 20,
            requesters: 10,
            sweep_interval: Some(Duration::from_millis(5)),
            ..Default::default()
        };

        let report = run_simulation(store.connector(&config), config, &args)
            .await
            .unwrap();

        // Offer ends 30 days out, so the sweeps find nothing
        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.deactivated, 0);
        assert_eq!(sweep.failures, 0);
        assert_eq!(report.outcomes.redeemed, 10);
        assert_eq!(report.remaining_quantity, 10);
    }

    #[tokio::test]
    async fn pool_that_cannot_connect_is_an_error() {
        let store = MemoryStore::new();
        store.fail_next_connects(1);
        let config = config(1);

        let err = run_simulation(store.connector(&config), config, &SimulateArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SimulateError::Pool(PoolError::Connect(_))));
    }
}
