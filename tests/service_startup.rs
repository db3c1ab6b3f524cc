//! Service startup: trading stays gated until a reconciliation succeeds

mod mock_exchange;

use mock_exchange::MockExchange;
use rust_decimal_macros::dec;
use std::sync::Arc;
use trade_ledger::{
    new_intent_id, EntryStatus, ExchangeError, IntentLedger, JournalConfig, JournalEntry,
    PositionSide, PositionSnapshot, ServiceRunner, Settings, Side, TradeError,
};

fn settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.service.session_id = "startup".to_string();
    settings.journal = JournalConfig::new(dir.join("journal").join("trade.wal"));
    settings.snapshot.dir = dir.join("state");
    settings.reconciler.startup_retry_secs = 0;
    settings.retry.max_retries = 0;
    settings
}

#[tokio::test]
async fn test_startup_blocks_until_reconciled() {
    let dir = tempfile::tempdir().unwrap();
    let exchange =
        MockExchange::new().with_position("BTCUSDT", PositionSide::Long, dec!(0.01), dec!(50000));
    exchange.fail_position_fetches(2);

    let mut runner = ServiceRunner::build(settings(dir.path()), Arc::new(exchange.clone()))
        .await
        .unwrap();
    let health = runner.health();
    assert!(!health.report().startup_reconciled);

    // Trade path is closed before startup reconciliation
    let recorder = runner.recorder();
    let entry = JournalEntry::intent(new_intent_id(), "ETHUSDT", Side::Buy, dec!(1));
    let pos = PositionSnapshot::new("ETHUSDT", PositionSide::Long, dec!(3000), dec!(1));
    let blocked = recorder
        .open_position(entry, pos, || async { Ok::<_, ExchangeError>(()) })
        .await;
    assert!(matches!(blocked, Err(TradeError::NotReconciled)));

    let report = runner.start().await;
    assert_eq!(exchange.position_calls(), 3);
    assert_eq!(report.ghosts.len(), 1);
    assert!(health.report().startup_reconciled);
    assert!(health.report().is_healthy());

    let id = new_intent_id();
    let entry = JournalEntry::intent(id.as_str(), "ETHUSDT", Side::Buy, dec!(1));
    let pos = PositionSnapshot::new("ETHUSDT", PositionSide::Long, dec!(3000), dec!(1));
    recorder
        .open_position(entry, pos, || async { Ok::<_, ExchangeError>(()) })
        .await
        .unwrap();

    let store = runner.store();
    let journal = runner.journal();
    runner.shutdown().await.unwrap();

    let ledger = IntentLedger::replay(journal.path(), 2).await.unwrap();
    assert_eq!(ledger.status(&id), Some(EntryStatus::Committed));
    let on_disk = store.load().await.unwrap().unwrap();
    assert_eq!(on_disk.open_positions.len(), 2);
    assert_eq!(on_disk.last_trade_id, id);
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_build() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    tokio::fs::create_dir_all(&settings.snapshot.dir).await.unwrap();
    tokio::fs::write(settings.snapshot.dir.join("session_startup.json"), b"not json")
        .await
        .unwrap();

    let result = ServiceRunner::build(settings, Arc::new(MockExchange::new())).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_restart_restores_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let exchange =
        MockExchange::new().with_position("BTCUSDT", PositionSide::Long, dec!(0.01), dec!(50000));

    let mut runner = ServiceRunner::build(settings(dir.path()), Arc::new(exchange.clone()))
        .await
        .unwrap();
    runner.start().await;
    runner.shutdown().await.unwrap();
    let orders_after_first_run = exchange.orders().len();

    let mut runner = ServiceRunner::build(settings(dir.path()), Arc::new(exchange.clone()))
        .await
        .unwrap();
    assert_eq!(runner.store().positions().await.len(), 1);
    let report = runner.start().await;
    assert!(report.is_clean());
    assert_eq!(exchange.orders().len(), orders_after_first_run);
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_protection_retried_before_next_soft_pass() {
    let dir = tempfile::tempdir().unwrap();
    let exchange =
        MockExchange::new().with_position("BTCUSDT", PositionSide::Long, dec!(0.01), dec!(50000));
    exchange.reject_orders(true);

    let mut settings = settings(dir.path());
    settings.guard_retry.base_delay_ms = 10;
    settings.guard_retry.max_delay_ms = 50;
    assert_eq!(settings.reconciler.soft_interval_secs, 3600);

    let mut runner = ServiceRunner::build(settings, Arc::new(exchange.clone()))
        .await
        .unwrap();
    let report = runner.start().await;
    assert_eq!(report.protection_failures, vec!["BTCUSDT".to_string()]);
    let health = runner.health();
    assert_eq!(health.report().unprotected_positions, 1);

    exchange.reject_orders(false);
    let mut protected = false;
    for _ in 0..200 {
        if health.report().unprotected_positions == 0 {
            protected = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(protected, "position still unprotected after 2s");

    let pos = runner
        .store()
        .get_position("BTCUSDT", PositionSide::Long)
        .await
        .unwrap();
    assert!(pos.is_protected());
    assert_eq!(exchange.orders_for("BTCUSDT").len(), 2);
    runner.shutdown().await.unwrap();
}
