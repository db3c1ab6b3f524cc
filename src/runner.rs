//! Service runner - startup sequencing and background tasks

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Settings;
use crate::exchange::{ExchangeClient, GuardedExchange};
use crate::health::HealthMonitor;
use crate::journal::Journal;
use crate::error::ReconcileError;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::retry::RetryPolicy;
use crate::state::SnapshotStore;
use crate::trade::TradeRecorder;

/// Owns the durability core and its background tasks
pub struct ServiceRunner {
    settings: Settings,
    health: HealthMonitor,
    journal: Arc<Journal>,
    store: Arc<SnapshotStore>,
    reconciler: Arc<Reconciler>,
    recorder: Arc<TradeRecorder>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceRunner {
    /// Open the journal, restore the snapshot and wire the reconciler.
    /// A corrupt snapshot file fails here rather than starting empty.
    pub async fn build(settings: Settings, exchange: Arc<dyn ExchangeClient>) -> anyhow::Result<Self> {
        let health = HealthMonitor::new();

        let journal = Journal::open(settings.journal.clone(), health.clone())
            .await
            .with_context(|| format!("opening journal {}", settings.journal.path.display()))?;
        let journal = Arc::new(journal);

        let store = Arc::new(SnapshotStore::new(
            settings.service.session_id.as_str(),
            settings.snapshot.clone(),
        ));
        store
            .load_and_restore()
            .await
            .context("loading state snapshot")?;

        let breaker = Arc::new(CircuitBreaker::new(
            exchange.name(),
            settings.circuit_breaker,
        ));
        let guarded = GuardedExchange::new(
            exchange,
            breaker,
            settings.exchange.call_timeout(),
            health.clone(),
        );

        let reconciler = Reconciler::new(
            guarded,
            Arc::clone(&journal),
            Arc::clone(&store),
            health.clone(),
            settings.reconciler.clone(),
        )
        .with_retry(
            RetryPolicy::from(settings.retry),
            RetryPolicy::from(settings.guard_retry),
        );

        let recorder = TradeRecorder::new(Arc::clone(&journal), Arc::clone(&store), health.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            settings,
            health,
            journal,
            store,
            reconciler: Arc::new(reconciler),
            recorder: Arc::new(recorder),
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    pub fn health(&self) -> HealthMonitor {
        self.health.clone()
    }

    /// Trade path handle. Refuses to trade until `start` has reconciled.
    pub fn recorder(&self) -> Arc<TradeRecorder> {
        Arc::clone(&self.recorder)
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    pub fn store(&self) -> Arc<SnapshotStore> {
        Arc::clone(&self.store)
    }

    pub fn journal(&self) -> Arc<Journal> {
        Arc::clone(&self.journal)
    }

    /// Reconcile until it succeeds, then enable trading and start the
    /// auto-save and soft-reconcile tasks.
    pub async fn start(&mut self) -> ReconcileReport {
        let report = self.startup_reconcile().await;
        self.health.mark_startup_reconciled();
        info!("Startup reconciliation complete, trading enabled");

        self.tasks
            .push(self.store.start_auto_save(self.shutdown_tx.subscribe()));
        self.tasks.push(self.spawn_soft_reconcile());
        report
    }

    /// Blocks until a pass succeeds. Dropping the future is the only way out
    /// early; a cancelled pass leaves the snapshot as of its last save.
    async fn startup_reconcile(&self) -> ReconcileReport {
        let backoff = self.settings.reconciler.startup_retry();
        let mut attempt = 1u32;

        loop {
            match self.reconciler.reconcile().await {
                Ok(report) => {
                    if !report.protection_failures.is_empty() {
                        error!(
                            "Positions left unprotected after startup: {:?}",
                            report.protection_failures
                        );
                    }
                    return report;
                }
                Err(e) => {
                    error!(
                        "Startup reconciliation attempt {} failed: {}, retrying in {:?}",
                        attempt, e, backoff
                    );
                }
            }

            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Periodic full passes, plus protective-order retries on the guard
    /// backoff schedule whenever a tracked position is left unprotected.
    fn spawn_soft_reconcile(&self) -> JoinHandle<()> {
        let reconciler = Arc::clone(&self.reconciler);
        let health = self.health.clone();
        let backoff = RetryPolicy::from(self.settings.guard_retry);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let period = reconciler.interval().max(std::time::Duration::from_millis(1));
            let mut ticker = interval(period);
            ticker.tick().await;
            let mut protect_attempt = 0u32;

            loop {
                let protect_in = (health.report().unprotected_positions > 0)
                    .then(|| backoff.delay(protect_attempt));

                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(report) = reconciler.soft_reconcile().await {
                            if !report.is_clean() {
                                warn!(
                                    "Soft reconcile corrected state: {} adopted, {} removed, {} synced",
                                    report.ghosts.len(),
                                    report.orphans_removed.len(),
                                    report.quantity_synced.len()
                                );
                            }
                        }
                        protect_attempt = 0;
                    }
                    _ = tokio::time::sleep(protect_in.unwrap_or_default()), if protect_in.is_some() => {
                        match reconciler.protect_unprotected().await {
                            Ok(0) => protect_attempt = 0,
                            Ok(left) => {
                                warn!("{} positions still unprotected, retrying", left);
                                protect_attempt = protect_attempt.saturating_add(1);
                            }
                            Err(ReconcileError::InProgress) => {}
                            Err(e) => {
                                warn!("Protective order retry failed: {}", e);
                                protect_attempt = protect_attempt.saturating_add(1);
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Soft reconcile task stopped");
        })
    }

    /// Stop background tasks, save the snapshot and drain the journal
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        info!("Shutting down...");
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }

        let saved = self.store.save().await.context("final state save");
        let closed = self.journal.close().await.context("closing journal");
        saved?;
        closed?;
        info!("Shutdown complete");
        Ok(())
    }
}
