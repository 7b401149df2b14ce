//! Background reclamation of expired reservations.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::StockLedger;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::manager::ReservationManager;
use crate::outcome::ReleaseOutcome;
use crate::services::{Catalog, OrderBook};

/// Sweeper cadence and batch size.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: std::time::Duration,
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

/// Extra work run at the end of every sweep pass.
#[async_trait]
pub trait SweepHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns how many records the hook removed.
    async fn after_sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>;
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired checkouts whose holds this pass returned to availability.
    pub released: usize,
    /// Expired checkouts another caller finished first.
    pub already_terminal: usize,
    /// Checkouts whose release failed; they are retried next pass.
    pub failed: usize,
    /// Records removed by hooks.
    pub housekept: u64,
}

/// Periodically releases checkouts whose deadline has passed.
///
/// Release is idempotent, so any number of replicas may sweep the same
/// ledger at once without coordination.
pub struct ExpirySweeper<L, C, O>
where
    L: StockLedger,
    C: Catalog,
    O: OrderBook,
{
    manager: Arc<ReservationManager<L, C, O>>,
    config: SweeperConfig,
    hooks: Vec<Arc<dyn SweepHook>>,
}

impl<L, C, O> ExpirySweeper<L, C, O>
where
    L: StockLedger,
    C: Catalog,
    O: OrderBook,
{
    pub fn new(manager: Arc<ReservationManager<L, C, O>>, config: SweeperConfig) -> Self {
        Self {
            manager,
            config,
            hooks: Vec::new(),
        }
    }

    /// Registers a hook to run after each pass.
    pub fn with_hook(mut self, hook: Arc<dyn SweepHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Runs one pass: releases every checkout that expired before `now`.
    ///
    /// A failure on one checkout is logged and counted; the pass carries on
    /// with the rest.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();

        loop {
            let batch = match self
                .manager
                .ledger()
                .expired_checkouts(now, self.config.batch_size + report.failed)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    metrics::counter!("sweeper_errors_total").increment(1);
                    tracing::warn!(error = %e, "could not list expired checkouts");
                    break;
                }
            };

            // Failed releases stay listed; widen the page past them and skip
            // refs already tried this pass.
            let fresh: Vec<_> = batch.into_iter().filter(|r| seen.insert(*r)).collect();
            if fresh.is_empty() {
                break;
            }

            for checkout_ref in fresh {
                match self.manager.release(checkout_ref).await {
                    Ok(ReleaseOutcome::Released { .. }) => report.released += 1,
                    Ok(ReleaseOutcome::NothingToRelease) => report.already_terminal += 1,
                    Err(e) => {
                        report.failed += 1;
                        metrics::counter!("sweeper_errors_total").increment(1);
                        tracing::warn!(%checkout_ref, error = %e, "expired checkout not released");
                    }
                }
            }
        }

        for hook in &self.hooks {
            match hook.after_sweep(now).await {
                Ok(removed) => report.housekept += removed,
                Err(e) => {
                    metrics::counter!("sweeper_errors_total").increment(1);
                    tracing::warn!(hook = hook.name(), error = %e, "sweep hook failed");
                }
            }
        }

        metrics::counter!("sweeper_released_total").increment(report.released as u64);
        if report.released > 0 || report.failed > 0 {
            tracing::info!(
                released = report.released,
                failed = report.failed,
                "sweep pass finished"
            );
        }
        report
    }

    /// Sweeps on a fixed interval until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.interval, "expiry sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;
    use common::{HolderId, ItemId, Money};
    use ledger::InMemoryStockLedger;

    use super::*;
    use crate::manager::ManagerConfig;
    use crate::outcome::CartLine;
    use crate::services::{InMemoryCatalog, InMemoryOrderBook};

    type TestManager = ReservationManager<InMemoryStockLedger, InMemoryCatalog, InMemoryOrderBook>;

    async fn manager() -> Arc<TestManager> {
        let ledger = InMemoryStockLedger::new();
        ledger.list_item(&ItemId::new("SKU-A"), 10).await.unwrap();
        let catalog = InMemoryCatalog::new();
        catalog.set_price("SKU-A", Money::from_cents(100)).await;
        Arc::new(ReservationManager::new(
            ledger,
            catalog,
            InMemoryOrderBook::new(),
            ManagerConfig::default(),
        ))
    }

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl SweepHook for CountingHook {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn after_sweep(
            &self,
            _now: DateTime<Utc>,
        ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        }
    }

    #[tokio::test]
    async fn test_sweep_leaves_live_holds_alone() {
        let m = manager().await;
        m.reserve(vec![CartLine::new("SKU-A", 3)], HolderId::guest(), None)
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(m.clone(), SweeperConfig::default());
        let report = sweeper.sweep_once(Utc::now()).await;

        assert_eq!(report, SweepReport::default());
        let level = m.ledger().stock_level(&ItemId::new("SKU-A")).await.unwrap().unwrap();
        assert_eq!(level.reserved_stock, 3);
    }

    #[tokio::test]
    async fn test_sweep_pages_through_batches() {
        let m = manager().await;
        for _ in 0..5 {
            m.reserve(vec![CartLine::new("SKU-A", 1)], HolderId::guest(), None)
                .await
                .unwrap();
        }

        let sweeper = ExpirySweeper::new(
            m.clone(),
            SweeperConfig {
                batch_size: 2,
                ..SweeperConfig::default()
            },
        );
        let report = sweeper.sweep_once(Utc::now() + Duration::minutes(11)).await;

        assert_eq!(report.released, 5);
        let level = m.ledger().stock_level(&ItemId::new("SKU-A")).await.unwrap().unwrap();
        assert_eq!(level.reserved_stock, 0);
        assert_eq!(level.total_stock, 10);
    }

    #[tokio::test]
    async fn test_hooks_run_every_pass() {
        let m = manager().await;
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let sweeper =
            ExpirySweeper::new(m, SweeperConfig::default()).with_hook(hook.clone());

        let report = sweeper.sweep_once(Utc::now()).await;
        sweeper.sweep_once(Utc::now()).await;

        assert_eq!(report.housekept, 2);
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let m = manager().await;
        let sweeper = ExpirySweeper::new(
            m,
            SweeperConfig {
                interval: std::time::Duration::from_millis(10),
                ..SweeperConfig::default()
            },
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sweeper.run(rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
