//! Trade path recording: intent first, exchange second, snapshot last

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ExchangeError, TradeError};
use crate::health::HealthMonitor;
use crate::journal::Journal;
use crate::state::SnapshotStore;
use crate::types::{EntryStatus, JournalEntry, PositionSide, PositionSnapshot};

/// Fresh intent id for the trade path
pub fn new_intent_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Wraps every exchange-mutating call in the journal protocol
///
/// 1. `log_intent` must succeed (fsynced) or the order is never sent.
/// 2. The exchange call runs.
/// 3. COMMITTED or FAILED is queued for the intent.
/// 4. The snapshot changes only after the exchange confirmed.
pub struct TradeRecorder {
    journal: Arc<Journal>,
    store: Arc<SnapshotStore>,
    health: HealthMonitor,
}

impl TradeRecorder {
    pub fn new(journal: Arc<Journal>, store: Arc<SnapshotStore>, health: HealthMonitor) -> Self {
        Self {
            journal,
            store,
            health,
        }
    }

    fn ensure_reconciled(&self) -> Result<(), TradeError> {
        if self.health.report().startup_reconciled {
            Ok(())
        } else {
            Err(TradeError::NotReconciled)
        }
    }

    /// Open (or add to) a position. `place` sends the order and is only
    /// called once the intent is durable.
    pub async fn open_position<T, F, Fut>(
        &self,
        entry: JournalEntry,
        mut position: PositionSnapshot,
        place: F,
    ) -> Result<T, TradeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.ensure_reconciled()?;
        let id = entry.id.clone();
        self.journal.log_intent(entry).await?;

        let confirmed = self.execute(&id, place).await?;

        position.intent_id = Some(id.clone());
        info!(
            "Opened {} {} qty {} @ {} (intent {})",
            position.side, position.symbol, position.quantity, position.entry_price, id
        );
        self.store.add_position(position).await?;
        self.store.set_last_trade_id(id.as_str()).await;
        Ok(confirmed)
    }

    /// Close a tracked position. The snapshot entry is dropped only after the
    /// exchange confirmed the close.
    pub async fn close_position<T, F, Fut>(
        &self,
        entry: JournalEntry,
        symbol: &str,
        side: PositionSide,
        place: F,
    ) -> Result<T, TradeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.ensure_reconciled()?;
        let id = entry.id.clone();
        self.journal.log_intent(entry).await?;

        let confirmed = self.execute(&id, place).await?;

        match self.store.remove_matching(symbol, side).await? {
            Some(pos) => info!("Closed {} {} qty {} (intent {})", side, symbol, pos.quantity, id),
            None => warn!("Closed {} {} but it was not tracked (intent {})", side, symbol, id),
        }
        self.store.set_last_trade_id(id.as_str()).await;
        Ok(confirmed)
    }

    async fn execute<T, F, Fut>(&self, id: &str, place: F) -> Result<T, TradeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        match place().await {
            Ok(value) => {
                // A lost terminal line is repaired by the reconciler
                if let Err(e) = self.journal.commit_update(id, EntryStatus::Committed).await {
                    warn!("Failed to queue commit for intent {}: {}", id, e);
                }
                debug!("Intent {} committed", id);
                Ok(value)
            }
            Err(e) => {
                if let Err(je) = self
                    .journal
                    .resolve(id, EntryStatus::Failed, Some(e.to_string()))
                    .await
                {
                    warn!("Failed to queue failure for intent {}: {}", id, je);
                }
                warn!("Intent {} failed: {}", id, e);
                Err(e.into())
            }
        }
    }
}
