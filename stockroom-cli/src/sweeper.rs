//! Periodic expiration sweep.

use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use stockroom::{Connector, ExpirationSweeper};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What a sweep loop did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub runs: usize,
    pub deactivated: usize,
    pub failures: usize,
}

/// Run `sweeper` every `interval` until `shutdown_rx` flips to `true`.
///
/// The first sweep runs immediately. A failed sweep is logged and counted;
/// the loop keeps going. `today` supplies the cut-off date for each run.
pub fn spawn_sweeper<K, F>(
    sweeper: ExpirationSweeper<K>,
    interval: Duration,
    today: F,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<SweepSummary>
where
    K: Connector,
    F: Fn() -> NaiveDate + Send + 'static,
{
    tokio::spawn(async move {
        let mut summary = SweepSummary::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            summary.runs += 1;
            match sweeper.deactivate_expired(today()).await {
                Ok(n) => summary.deactivated += n,
                Err(e) => {
                    summary.failures += 1;
                    tracing::warn!(error = %e, "Sweep run failed, retrying next tick");
                }
            }
        }

        tracing::info!(
            runs = summary.runs,
            deactivated = summary.deactivated,
            failures = summary.failures,
            "Sweeper stopped"
        );
        summary
    })
}
