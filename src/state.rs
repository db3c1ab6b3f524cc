//! State snapshot store - the process's belief about open positions, persisted
//! as `state/session_<id>.json`

use chrono::Utc;
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SnapshotConfig;
use crate::error::SnapshotError;
use crate::types::{PositionSide, PositionSnapshot, StateSnapshot};

/// In-memory snapshot behind a reader-writer lock, with atomic persistence
pub struct SnapshotStore {
    path: PathBuf,
    config: SnapshotConfig,
    state: RwLock<StateSnapshot>,
    /// Serializes disk writes so an older copy never renames over a newer one
    save_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(session_id: impl Into<String>, config: SnapshotConfig) -> Self {
        let session_id = session_id.into();
        let path = snapshot_path(&config.dir, &session_id);
        Self {
            path,
            config,
            state: RwLock::new(StateSnapshot::new(session_id)),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state atomically: temp file, fsync, rename.
    pub async fn save(&self) -> Result<(), SnapshotError> {
        let _guard = self.save_lock.lock().await;

        let copy = {
            let mut state = self.state.write().await;
            state.timestamp = Utc::now();
            state.clone()
        };

        let json = serde_json::to_vec_pretty(&copy)?;
        let io_err = |source| SnapshotError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await.map_err(io_err)?;
        }

        let tmp = tmp_path(&self.path);
        let mut file = fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(&json).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        sync_dir(self.path.parent()).await;

        debug!(
            "Saved state snapshot {} ({} positions)",
            self.path.display(),
            copy.open_positions.len()
        );
        Ok(())
    }

    /// Read the canonical file. `Ok(None)` means a fresh start; a file that
    /// exists but does not decode is `SnapshotError::Corrupt`.
    pub async fn load(&self) -> Result<Option<StateSnapshot>, SnapshotError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SnapshotError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Load from disk into memory. Returns whether a previous state was found.
    pub async fn load_and_restore(&self) -> Result<bool, SnapshotError> {
        match self.load().await? {
            Some(snapshot) => {
                info!(
                    "Restored state snapshot from {} ({} open positions)",
                    self.path.display(),
                    snapshot.open_positions.len()
                );
                self.restore(snapshot).await;
                Ok(true)
            }
            None => {
                info!("No state snapshot at {}, starting fresh", self.path.display());
                Ok(false)
            }
        }
    }

    /// Replace the in-memory state. The store's own session id is kept.
    pub async fn restore(&self, mut snapshot: StateSnapshot) {
        let mut state = self.state.write().await;
        snapshot.session_id = state.session_id.clone();
        *state = snapshot;
    }

    /// Track a position and persist immediately. A position with the same
    /// symbol and side is replaced.
    pub async fn add_position(&self, position: PositionSnapshot) -> Result<(), SnapshotError> {
        {
            let mut state = self.state.write().await;
            state
                .open_positions
                .retain(|p| !p.matches(&position.symbol, position.side));
            state.open_positions.push(position);
        }
        self.save().await
    }

    /// Drop every position on `symbol` and persist immediately
    pub async fn remove_position(&self, symbol: &str) -> Result<Vec<PositionSnapshot>, SnapshotError> {
        let removed = {
            let mut state = self.state.write().await;
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.open_positions)
                .into_iter()
                .partition(|p| p.symbol == symbol);
            state.open_positions = kept;
            removed
        };
        self.save().await?;
        Ok(removed)
    }

    /// Drop the one position on `symbol` + `side` and persist immediately
    pub async fn remove_matching(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<PositionSnapshot>, SnapshotError> {
        let removed = {
            let mut state = self.state.write().await;
            let idx = state.open_positions.iter().position(|p| p.matches(symbol, side));
            idx.map(|i| state.open_positions.remove(i))
        };
        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Balance changes are frequent; they ride on the auto-save
    pub async fn update_balance(&self, total: Decimal, available: Decimal) {
        let mut state = self.state.write().await;
        state.total_balance = total;
        state.available_balance = available;
    }

    pub async fn set_last_trade_id(&self, id: impl Into<String>) {
        self.state.write().await.last_trade_id = id.into();
    }

    pub async fn set_market_regime(&self, regime: impl Into<String>) {
        self.state.write().await.market_regime = regime.into();
    }

    /// Record confirmed protective levels and persist. `None` leaves a level
    /// unchanged. Returns false if the position is no longer tracked.
    pub async fn update_position_protection(
        &self,
        symbol: &str,
        side: PositionSide,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<bool, SnapshotError> {
        let found = {
            let mut state = self.state.write().await;
            match state.open_positions.iter_mut().find(|p| p.matches(symbol, side)) {
                Some(pos) => {
                    if stop_loss.is_some() {
                        pos.stop_loss = stop_loss;
                    }
                    if take_profit.is_some() {
                        pos.take_profit = take_profit;
                    }
                    true
                }
                None => false,
            }
        };
        if found {
            self.save().await?;
        }
        Ok(found)
    }

    /// Sync a tracked quantity to what the exchange reports, and persist
    pub async fn update_position_quantity(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<bool, SnapshotError> {
        let found = {
            let mut state = self.state.write().await;
            match state.open_positions.iter_mut().find(|p| p.matches(symbol, side)) {
                Some(pos) => {
                    pos.quantity = quantity;
                    true
                }
                None => false,
            }
        };
        if found {
            self.save().await?;
        }
        Ok(found)
    }

    /// Link a tracked position to the intent that opened it, if it has none.
    /// Persisted by the caller's next save.
    pub async fn link_intent(&self, symbol: &str, side: PositionSide, intent_id: &str) -> bool {
        let mut state = self.state.write().await;
        match state.open_positions.iter_mut().find(|p| p.matches(symbol, side)) {
            Some(pos) if pos.intent_id.is_none() => {
                pos.intent_id = Some(intent_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub async fn get_position(&self, symbol: &str, side: PositionSide) -> Option<PositionSnapshot> {
        self.state
            .read()
            .await
            .open_positions
            .iter()
            .find(|p| p.matches(symbol, side))
            .cloned()
    }

    pub async fn positions(&self) -> Vec<PositionSnapshot> {
        self.state.read().await.open_positions.clone()
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.state.read().await.clone()
    }

    /// Periodic safety-net save. Runs until `shutdown` flips to true, then
    /// saves once more.
    pub fn start_auto_save(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = self.config.autosave_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.save().await {
                            warn!("Auto-save failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = store.save().await {
                error!("Final state save failed: {}", e);
            }
            debug!("Auto-save task stopped");
        })
    }
}

/// `<dir>/session_<id>.json`
pub fn snapshot_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("session_{}.json", session_id))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Make the rename itself durable. Best effort; not every platform allows it.
async fn sync_dir(dir: Option<&Path>) {
    let Some(dir) = dir else { return };
    if !cfg!(unix) {
        return;
    }
    if let Ok(handle) = fs::File::open(dir).await {
        if let Err(e) = handle.sync_all().await {
            debug!("Directory sync failed for {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> Arc<SnapshotStore> {
        Arc::new(SnapshotStore::new(
            "test",
            SnapshotConfig {
                dir: dir.to_path_buf(),
                autosave_secs: 30,
            },
        ))
    }

    fn btc_long() -> PositionSnapshot {
        let mut pos = PositionSnapshot::new("BTCUSDT", PositionSide::Long, dec!(50000), dec!(0.01));
        pos.stop_loss = Some(dec!(49500));
        pos.take_profit = Some(dec!(51000));
        pos.confidence = 0.85;
        pos.intent_id = Some("t1".to_string());
        pos
    }

    #[tokio::test]
    async fn test_load_absent_is_fresh_start() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.load_and_restore().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        store.add_position(btc_long()).await.unwrap();
        store.update_balance(dec!(1000.50), dec!(750.25)).await;
        store.set_last_trade_id("t1").await;
        store.set_market_regime("trending").await;
        store.save().await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, store.snapshot().await);
        assert_eq!(store.path(), dir.path().join("session_test.json"));
        assert!(!tmp_path(store.path()).exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_not_fresh_start() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        fs::write(store.path(), b"{\"session_id\": \"test\", \"open_po").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_position_mutations_persist_immediately() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        store.add_position(btc_long()).await.unwrap();
        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.open_positions.len(), 1);

        // Same symbol and side replaces rather than duplicates
        let mut resized = btc_long();
        resized.quantity = dec!(0.02);
        store.add_position(resized).await.unwrap();
        assert_eq!(store.positions().await.len(), 1);

        let removed = store.remove_position("BTCUSDT").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].quantity, dec!(0.02));
        let on_disk = store.load().await.unwrap().unwrap();
        assert!(on_disk.open_positions.is_empty());
    }

    #[tokio::test]
    async fn test_balance_update_waits_for_save() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.save().await.unwrap();

        store.update_balance(dec!(500), dec!(400)).await;
        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.total_balance, Decimal::ZERO);

        store.save().await.unwrap();
        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.total_balance, dec!(500));
    }

    #[tokio::test]
    async fn test_protection_and_quantity_updates() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut pos = btc_long();
        pos.stop_loss = None;
        pos.take_profit = None;
        store.add_position(pos).await.unwrap();

        assert!(store
            .update_position_protection("BTCUSDT", PositionSide::Long, Some(dec!(49500)), None)
            .await
            .unwrap());
        assert!(!store.get_position("BTCUSDT", PositionSide::Long).await.unwrap().is_protected());
        assert!(store
            .update_position_protection("BTCUSDT", PositionSide::Long, None, Some(dec!(51000)))
            .await
            .unwrap());
        assert!(!store
            .update_position_protection("BTCUSDT", PositionSide::Short, Some(dec!(1)), Some(dec!(2)))
            .await
            .unwrap());
        assert!(store
            .update_position_quantity("BTCUSDT", PositionSide::Long, dec!(0.005))
            .await
            .unwrap());

        let pos = store.get_position("BTCUSDT", PositionSide::Long).await.unwrap();
        assert!(pos.is_protected());
        assert_eq!(pos.quantity, dec!(0.005));
    }

    #[tokio::test]
    async fn test_link_intent_only_fills_empty_link() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut pos = btc_long();
        pos.intent_id = None;
        store.add_position(pos).await.unwrap();

        assert!(store.link_intent("BTCUSDT", PositionSide::Long, "t7").await);
        assert!(!store.link_intent("BTCUSDT", PositionSide::Long, "t8").await);
        assert!(!store.link_intent("ETHUSDT", PositionSide::Long, "t9").await);
        let pos = store.get_position("BTCUSDT", PositionSide::Long).await.unwrap();
        assert_eq!(pos.intent_id.as_deref(), Some("t7"));
    }

    #[tokio::test]
    async fn test_restore_keeps_session_id() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut other = StateSnapshot::new("elsewhere");
        other.open_positions.push(btc_long());

        store.restore(other).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.session_id, "test");
        assert_eq!(snap.open_positions.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_save_saves_on_shutdown() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let (tx, rx) = watch::channel(false);
        let handle = store.start_auto_save(rx);

        store.update_balance(dec!(42), dec!(42)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.available_balance, dec!(42));
    }
}
