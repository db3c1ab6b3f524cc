//! Position reconciliation - align the snapshot and journal with the exchange
//!
//! The exchange is ground truth. Positions it reports that we do not track are
//! ghosts: they are adopted into the snapshot and protected with stop-loss and
//! take-profit orders straight away. Tracked positions it no longer reports are
//! orphans and are dropped. Intents that never got a terminal status are
//! resolved once they are old enough that no in-flight request can still land.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReconcilerConfig;
use crate::error::{JournalError, ReconcileError};
use crate::exchange::GuardedExchange;
use crate::health::HealthMonitor;
use crate::intent::IntentLedger;
use crate::journal::Journal;
use crate::retry::RetryPolicy;
use crate::state::SnapshotStore;
use crate::types::{
    EntryStatus, ExchangePosition, JournalEntry, PositionSide, PositionSnapshot, ProtectiveOrder,
    Trigger,
};

/// Journal message on a ghost adoption
pub const GHOST_ADOPTED: &str = "GHOST_ADOPTED";
/// Journal message when a tracked position disappeared from the exchange
pub const ORPHAN_REMOVED: &str = "ORPHAN_REMOVED";
/// Journal message for an intent that never reached the exchange
pub const STALE_INTENT: &str = "STALE_INTENT";
/// Journal message for an intent whose position is confirmed open
pub const INTENT_CONFIRMED: &str = "INTENT_CONFIRMED";

/// Progress of one ghost position through a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GhostState {
    Unknown,
    /// Exchange has it, the snapshot does not
    Detected,
    /// Snapshot updated
    Adopted,
    /// Protective orders confirmed by the exchange
    RiskAttached,
    Reconciled,
}

#[derive(Debug, Clone)]
pub struct GhostOutcome {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub intent_id: String,
    pub state: GhostState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantityDrift {
    pub symbol: String,
    pub side: PositionSide,
    pub tracked: Decimal,
    pub exchange: Decimal,
}

/// What one reconciliation pass found and did
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub timestamp: DateTime<Utc>,
    pub exchange_positions: usize,
    pub matched: Vec<String>,
    pub ghosts: Vec<GhostOutcome>,
    pub quantity_synced: Vec<QuantityDrift>,
    /// Symbols that had protective orders attached this pass
    pub protected: Vec<String>,
    pub protection_failures: Vec<String>,
    pub orphans_removed: Vec<PositionSnapshot>,
    /// Intent ids resolved as COMMITTED because their position is open
    pub intents_confirmed: Vec<String>,
    /// Intent ids resolved as FAILED after the grace period
    pub stale_resolved: Vec<String>,
    /// Symbols left alone because a trade on them is still in flight
    pub deferred: Vec<String>,
}

impl ReconcileReport {
    fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            exchange_positions: 0,
            matched: Vec::new(),
            ghosts: Vec::new(),
            quantity_synced: Vec::new(),
            protected: Vec::new(),
            protection_failures: Vec::new(),
            orphans_removed: Vec::new(),
            intents_confirmed: Vec::new(),
            stale_resolved: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Nothing needed changing
    pub fn is_clean(&self) -> bool {
        self.ghosts.is_empty()
            && self.quantity_synced.is_empty()
            && self.protected.is_empty()
            && self.protection_failures.is_empty()
            && self.orphans_removed.is_empty()
            && self.intents_confirmed.is_empty()
            && self.stale_resolved.is_empty()
    }
}

/// Snapshot-vs-exchange comparison, before anything is applied
#[derive(Debug, Default)]
struct PositionDiff {
    matched: Vec<PositionSnapshot>,
    drift: Vec<QuantityDrift>,
    ghosts: Vec<ExchangePosition>,
    orphans: Vec<PositionSnapshot>,
}

fn compare_positions(tracked: &[PositionSnapshot], exchange: &[ExchangePosition]) -> PositionDiff {
    let live: HashMap<(&str, PositionSide), &ExchangePosition> = exchange
        .iter()
        .filter(|p| p.is_open())
        .map(|p| ((p.symbol.as_str(), p.side), p))
        .collect();

    let mut diff = PositionDiff::default();
    let mut seen = HashSet::new();

    for pos in tracked {
        let key = (pos.symbol.as_str(), pos.side);
        seen.insert(key);
        match live.get(&key) {
            Some(live_pos) if live_pos.quantity == pos.quantity => diff.matched.push(pos.clone()),
            Some(live_pos) => {
                diff.drift.push(QuantityDrift {
                    symbol: pos.symbol.clone(),
                    side: pos.side,
                    tracked: pos.quantity,
                    exchange: live_pos.quantity,
                });
                diff.matched.push(pos.clone());
            }
            None => diff.orphans.push(pos.clone()),
        }
    }

    let mut ghosts: Vec<ExchangePosition> = live
        .iter()
        .filter(|(key, _)| !seen.contains(*key))
        .map(|(_, p)| (*p).clone())
        .collect();
    ghosts.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    diff.ghosts = ghosts;

    diff
}

/// Stop-loss / take-profit levels around `price`
pub fn protective_levels(
    side: PositionSide,
    price: Decimal,
    stop_loss_pct: Decimal,
    take_profit_pct: Decimal,
) -> (Decimal, Decimal) {
    match side {
        PositionSide::Long => (
            price * (Decimal::ONE - stop_loss_pct),
            price * (Decimal::ONE + take_profit_pct),
        ),
        PositionSide::Short => (
            price * (Decimal::ONE + stop_loss_pct),
            price * (Decimal::ONE - take_profit_pct),
        ),
    }
}

/// Reconciles the snapshot and journal against the exchange
pub struct Reconciler {
    exchange: GuardedExchange,
    journal: Arc<Journal>,
    store: Arc<SnapshotStore>,
    health: HealthMonitor,
    config: ReconcilerConfig,
    retry: RetryPolicy,
    guard_retry: RetryPolicy,
    in_flight: Mutex<()>,
    last_reconciliation: parking_lot::Mutex<Option<Instant>>,
    reconciliation_interval: Duration,
}

impl Reconciler {
    pub fn new(
        exchange: GuardedExchange,
        journal: Arc<Journal>,
        store: Arc<SnapshotStore>,
        health: HealthMonitor,
        config: ReconcilerConfig,
    ) -> Self {
        let reconciliation_interval = config.soft_interval();
        Self {
            exchange,
            journal,
            store,
            health,
            config,
            retry: RetryPolicy::default(),
            guard_retry: RetryPolicy::default(),
            in_flight: Mutex::new(()),
            last_reconciliation: parking_lot::Mutex::new(None),
            reconciliation_interval,
        }
    }

    /// Policies for ordinary calls and for the protective-order path
    pub fn with_retry(mut self, retry: RetryPolicy, guard_retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.guard_retry = guard_retry;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.reconciliation_interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.reconciliation_interval
    }

    /// Check if a soft reconciliation is due
    pub fn is_due(&self) -> bool {
        let last = *self.last_reconciliation.lock();
        last.map(|t| t.elapsed() >= self.reconciliation_interval)
            .unwrap_or(true)
    }

    /// Run one full pass. Fails fast with `InProgress` if another pass is
    /// running, and with `Fetch` before touching local state if the exchange
    /// cannot be read.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _pass = self.in_flight.try_lock().map_err(|_| ReconcileError::InProgress)?;

        let result = self.run_pass().await;
        match &result {
            Ok(report) => {
                *self.last_reconciliation.lock() = Some(Instant::now());
                self.health.record_reconcile(Ok(()));
                info!(
                    "Reconciliation complete: {} exchange positions, {} matched, {} adopted, {} removed, {} stale intents",
                    report.exchange_positions,
                    report.matched.len(),
                    report.ghosts.len(),
                    report.orphans_removed.len(),
                    report.stale_resolved.len()
                );
            }
            Err(e) => {
                self.health.record_reconcile(Err(e.to_string()));
                error!("Reconciliation failed: {}", e);
            }
        }
        result
    }

    /// Periodic pass. Skipped when another pass is running; failures are
    /// logged and left for the next tick.
    pub async fn soft_reconcile(&self) -> Option<ReconcileReport> {
        match self.reconcile().await {
            Ok(report) => Some(report),
            Err(ReconcileError::InProgress) => {
                debug!("Soft reconcile skipped, pass already running");
                None
            }
            Err(e) => {
                warn!("Soft reconcile failed, retrying next tick: {}", e);
                None
            }
        }
    }

    /// Retry protective orders for tracked positions that are still open on
    /// the exchange and lack them. Returns how many remain unprotected.
    pub async fn protect_unprotected(&self) -> Result<usize, ReconcileError> {
        let _pass = self.in_flight.try_lock().map_err(|_| ReconcileError::InProgress)?;

        let exchange_positions = self
            .exchange
            .get_open_positions(&self.retry)
            .await
            .map_err(ReconcileError::Fetch)?;

        let mut remaining = 0;
        for pos in self.store.positions().await {
            if pos.is_protected() {
                continue;
            }
            let live = exchange_positions
                .iter()
                .any(|p| p.is_open() && p.symbol == pos.symbol && p.side == pos.side);
            if !live {
                // Closed meanwhile; the next full pass removes it
                continue;
            }
            match self.attach_risk(&pos).await {
                Ok(()) => info!(symbol = %pos.symbol, side = %pos.side, "Unprotected position recovered"),
                Err(e) => {
                    error!("{}", e);
                    remaining += 1;
                }
            }
        }

        self.health.set_unprotected_positions(remaining);
        Ok(remaining)
    }

    async fn run_pass(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::new();

        let exchange_positions = self
            .exchange
            .get_open_positions(&self.retry)
            .await
            .map_err(ReconcileError::Fetch)?;
        report.exchange_positions = exchange_positions.iter().filter(|p| p.is_open()).count();

        // Terminal writes from earlier passes are buffered; make them visible
        if let Err(e) = self.journal.flush().await {
            warn!("Journal flush before replay failed: {}", e);
        }
        let mut ledger =
            IntentLedger::replay(self.journal.path(), self.journal.config().replay_files).await?;

        let tracked = self.store.positions().await;
        let diff = compare_positions(&tracked, &exchange_positions);
        report.matched = diff.matched.iter().map(|p| p.symbol.clone()).collect();

        // Once trading is enabled a young unresolved intent may be an order
        // this process is still waiting on; its trade path owns the outcome.
        let trading = self.health.report().startup_reconciled;
        let now = Utc::now();
        let grace = self.config.stale_intent_grace();

        for ghost in &diff.ghosts {
            if trading {
                if let Some(record) = ledger.unresolved_opening(&ghost.symbol, ghost.side) {
                    if record.age(now) < grace {
                        info!(
                            symbol = %ghost.symbol,
                            intent = %record.id,
                            "Untracked position belongs to an in-flight intent, leaving it to the trade path"
                        );
                        report.deferred.push(ghost.symbol.clone());
                        continue;
                    }
                }
            }
            let outcome = self.adopt_ghost(ghost, &mut ledger).await?;
            match outcome.state {
                GhostState::Reconciled => report.protected.push(outcome.symbol.clone()),
                _ => report.protection_failures.push(outcome.symbol.clone()),
            }
            report.ghosts.push(outcome);
        }

        for drift in diff.drift {
            warn!(
                symbol = %drift.symbol,
                side = %drift.side,
                "Quantity drift: tracked {} vs exchange {}, syncing to exchange",
                drift.tracked,
                drift.exchange
            );
            self.store
                .update_position_quantity(&drift.symbol, drift.side, drift.exchange)
                .await?;
            report.quantity_synced.push(drift);
        }

        for pos in &diff.matched {
            let Some(current) = self.store.get_position(&pos.symbol, pos.side).await else {
                continue;
            };
            if current.is_protected() {
                continue;
            }
            warn!(symbol = %current.symbol, side = %current.side, "Tracked position is unprotected");
            match self.attach_risk(&current).await {
                Ok(()) => report.protected.push(current.symbol.clone()),
                Err(e) => {
                    error!("{}", e);
                    report.protection_failures.push(current.symbol.clone());
                }
            }
        }

        for orphan in diff.orphans {
            if trading {
                if let Some(id) = in_flight_close(&ledger, &orphan, now, grace) {
                    info!(
                        symbol = %orphan.symbol,
                        intent = %id,
                        "Closed position has an in-flight close intent, leaving it to the trade path"
                    );
                    report.deferred.push(orphan.symbol.clone());
                    continue;
                }
            }
            self.remove_orphan(&orphan, &mut ledger).await?;
            report.orphans_removed.push(orphan);
        }

        self.resolve_leftover_intents(&exchange_positions, &mut ledger, &mut report)
            .await?;

        self.store.save().await?;

        let unprotected = self
            .store
            .positions()
            .await
            .iter()
            .filter(|p| !p.is_protected())
            .count();
        self.health.set_unprotected_positions(unprotected);

        Ok(report)
    }

    /// Walk one ghost through detected, adopted, risk-attached, reconciled.
    /// A failed risk attachment leaves it adopted and unprotected; the next
    /// pass picks it up again.
    async fn adopt_ghost(
        &self,
        ghost: &ExchangePosition,
        ledger: &mut IntentLedger,
    ) -> Result<GhostOutcome, ReconcileError> {
        let mut state = advance(&ghost.symbol, GhostState::Unknown, GhostState::Detected);
        warn!(
            symbol = %ghost.symbol,
            side = %ghost.side,
            "Ghost position detected: qty {} @ {}",
            ghost.quantity,
            ghost.entry_price
        );

        let (intent_id, opened_at) = match ledger.unresolved_opening(&ghost.symbol, ghost.side) {
            Some(record) => {
                let id = record.id.clone();
                let opened_at = record.intent_at.unwrap_or(record.updated_at);
                info!(symbol = %ghost.symbol, intent = %id, "Ghost matches unresolved intent");
                (id, opened_at)
            }
            None => {
                let id = synthetic_intent_id();
                let entry = JournalEntry::intent(
                    id.as_str(),
                    ghost.symbol.as_str(),
                    ghost.side.opening_side(),
                    ghost.quantity,
                )
                .with_price(ghost.entry_price)
                .with_message(GHOST_ADOPTED);
                self.journal.log_intent(entry).await?;
                (id, Utc::now())
            }
        };
        self.resolve_intent(ledger, &intent_id, EntryStatus::Committed, GHOST_ADOPTED)
            .await?;

        let mut position =
            PositionSnapshot::new(ghost.symbol.as_str(), ghost.side, ghost.entry_price, ghost.quantity);
        position.confidence = self.config.adopted_confidence;
        position.opened_at = opened_at;
        position.intent_id = Some(intent_id.clone());
        self.store.add_position(position.clone()).await?;
        state = advance(&ghost.symbol, state, GhostState::Adopted);
        info!(symbol = %ghost.symbol, intent = %intent_id, "Ghost position adopted");

        match self.attach_risk(&position).await {
            Ok(()) => {
                state = advance(&ghost.symbol, state, GhostState::RiskAttached);
                state = advance(&ghost.symbol, state, GhostState::Reconciled);
            }
            Err(e) => error!("{}", e),
        }

        Ok(GhostOutcome {
            symbol: ghost.symbol.clone(),
            side: ghost.side,
            quantity: ghost.quantity,
            intent_id,
            state,
        })
    }

    /// Place whichever protective legs are missing and record each one as
    /// soon as the exchange confirms it.
    async fn attach_risk(&self, position: &PositionSnapshot) -> Result<(), ReconcileError> {
        let risk_err = |source| ReconcileError::RiskAttachment {
            symbol: position.symbol.clone(),
            source,
        };

        let price = match self
            .exchange
            .get_latest_price(&position.symbol, &self.retry)
            .await
        {
            Ok(price) => price,
            Err(e) => {
                warn!(
                    symbol = %position.symbol,
                    "Latest price unavailable ({}), using entry price {}",
                    e,
                    position.entry_price
                );
                position.entry_price
            }
        };

        let (stop_loss, take_profit) = protective_levels(
            position.side,
            price,
            self.config.emergency_stop_loss_pct,
            self.config.emergency_take_profit_pct,
        );

        if position.stop_loss.is_none() {
            let order = self.protective_order(position, Trigger::StopLoss(stop_loss));
            self.exchange
                .place_protective_order(&order, &self.guard_retry)
                .await
                .map_err(risk_err)?;
            self.store
                .update_position_protection(&position.symbol, position.side, Some(stop_loss), None)
                .await?;
        }

        if position.take_profit.is_none() {
            let order = self.protective_order(position, Trigger::TakeProfit(take_profit));
            self.exchange
                .place_protective_order(&order, &self.guard_retry)
                .await
                .map_err(risk_err)?;
            self.store
                .update_position_protection(&position.symbol, position.side, None, Some(take_profit))
                .await?;
        }

        info!(
            symbol = %position.symbol,
            side = %position.side,
            "Risk attached: stop {} / target {}",
            stop_loss,
            take_profit
        );
        Ok(())
    }

    fn protective_order(&self, position: &PositionSnapshot, trigger: Trigger) -> ProtectiveOrder {
        ProtectiveOrder {
            symbol: position.symbol.clone(),
            side: position.side.closing_side(),
            trigger,
            quantity: position.quantity,
        }
    }

    /// Drop a position the exchange no longer has, and close out the intents
    /// that explain it.
    async fn remove_orphan(
        &self,
        orphan: &PositionSnapshot,
        ledger: &mut IntentLedger,
    ) -> Result<(), ReconcileError> {
        warn!(
            symbol = %orphan.symbol,
            side = %orphan.side,
            "Position closed outside the trade path, removing (qty {})",
            orphan.quantity
        );
        self.store.remove_matching(&orphan.symbol, orphan.side).await?;

        let mut ids: Vec<String> = ledger
            .unresolved()
            .into_iter()
            .filter(|r| r.symbol == orphan.symbol && r.side == Some(orphan.side.closing_side()))
            .map(|r| r.id.clone())
            .collect();
        if let Some(id) = &orphan.intent_id {
            if ledger.get(id).map_or(false, |r| r.is_unresolved()) {
                ids.push(id.clone());
            }
        }

        for id in ids {
            self.resolve_intent(ledger, &id, EntryStatus::Committed, ORPHAN_REMOVED)
                .await?;
        }
        Ok(())
    }

    /// Unresolved intents older than the grace period: COMMITTED if their
    /// position is open on the exchange and not already owned by another
    /// intent, FAILED otherwise.
    async fn resolve_leftover_intents(
        &self,
        exchange_positions: &[ExchangePosition],
        ledger: &mut IntentLedger,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let now = Utc::now();
        let grace = self.config.stale_intent_grace();

        let expired: Vec<(String, Option<(String, PositionSide)>)> = ledger
            .unresolved()
            .into_iter()
            .filter(|r| r.age(now) >= grace)
            .map(|r| {
                let open = exchange_positions
                    .iter()
                    .find(|p| {
                        p.is_open() && p.symbol == r.symbol && r.opens().map_or(true, |s| s == p.side)
                    })
                    .map(|p| (p.symbol.clone(), p.side));
                (r.id.clone(), open)
            })
            .collect();

        for (id, open) in expired {
            let confirmed = match open {
                Some((symbol, side)) => self.owns_position(&symbol, side, &id).await,
                None => false,
            };
            if confirmed {
                info!(intent = %id, "Intent confirmed by open exchange position");
                self.resolve_intent(ledger, &id, EntryStatus::Committed, INTENT_CONFIRMED)
                    .await?;
                report.intents_confirmed.push(id);
            } else {
                warn!(intent = %id, "Stale intent never reached the exchange, marking failed");
                self.resolve_intent(ledger, &id, EntryStatus::Failed, STALE_INTENT)
                    .await?;
                report.stale_resolved.push(id);
            }
        }
        Ok(())
    }

    /// An open position confirms an intent only if no other intent already
    /// accounts for it. An unlinked tracked position is linked to `id`.
    async fn owns_position(&self, symbol: &str, side: PositionSide, id: &str) -> bool {
        match self.store.get_position(symbol, side).await {
            Some(pos) => match pos.intent_id.as_deref() {
                Some(linked) => linked == id,
                None => self.store.link_intent(symbol, side, id).await,
            },
            None => true,
        }
    }

    async fn resolve_intent(
        &self,
        ledger: &mut IntentLedger,
        id: &str,
        status: EntryStatus,
        message: &str,
    ) -> Result<(), JournalError> {
        self.journal
            .resolve(id, status, Some(message.to_string()))
            .await?;
        ledger.mark_resolved(id, status, Some(message.to_string()));
        Ok(())
    }
}

/// Young unresolved intent closing `orphan`, if any
fn in_flight_close(
    ledger: &IntentLedger,
    orphan: &PositionSnapshot,
    now: DateTime<Utc>,
    grace: Duration,
) -> Option<String> {
    ledger
        .unresolved()
        .into_iter()
        .find(|r| {
            r.symbol == orphan.symbol
                && r.side == Some(orphan.side.closing_side())
                && r.age(now) < grace
        })
        .map(|r| r.id.clone())
}

fn advance(symbol: &str, from: GhostState, to: GhostState) -> GhostState {
    debug!(symbol = %symbol, "Ghost {:?} -> {:?}", from, to);
    to
}

/// `recon_` plus 8 hex chars
fn synthetic_intent_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("recon_{}", &uuid[..8])
}
