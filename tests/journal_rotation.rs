//! Rotation boundary: entries on either side of a rotation land in exactly
//! one file each, none lost and none duplicated.

use std::path::{Path, PathBuf};
use trade_ledger::{EntryStatus, HealthMonitor, IntentLedger, Journal, JournalConfig, JournalEntry};

fn rotation_config(dir: &Path) -> JournalConfig {
    JournalConfig {
        // Only explicit flushes write, so batch boundaries are ours
        batch_size: 10_000,
        flush_interval_ms: 3_600_000,
        max_file_bytes: 1024,
        ..JournalConfig::new(dir.join("trade.wal"))
    }
}

async fn read_ids(path: &Path) -> Vec<String> {
    let content = tokio::fs::read_to_string(path).await.unwrap();
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str::<JournalEntry>(l).unwrap().id)
        .collect()
}

async fn rotated(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("trade.") && name.ends_with(".wal") && name != "trade.wal" {
            found.push(entry.path());
        }
    }
    found
}

async fn commit_batch(journal: &Journal, prefix: &str, count: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..count {
        let id = format!("{}-{:03}", prefix, i);
        journal.commit_update(&id, EntryStatus::Committed).await.unwrap();
        ids.push(id);
    }
    journal.flush().await.unwrap();
    ids
}

#[tokio::test]
async fn test_single_rotation_keeps_both_sides_intact() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(rotation_config(dir.path()), HealthMonitor::new())
        .await
        .unwrap();

    // ~80 bytes per line: the first batch alone crosses the ceiling
    let before = commit_batch(&journal, "pre", 20).await;
    assert!(rotated(dir.path()).await.is_empty());

    let after = commit_batch(&journal, "post", 5).await;
    let more = commit_batch(&journal, "late", 3).await;
    journal.close().await.unwrap();

    let rotated_files = rotated(dir.path()).await;
    assert_eq!(rotated_files.len(), 1, "expected exactly one rotation");

    assert_eq!(read_ids(&rotated_files[0]).await, before);

    let mut expected_active = after.clone();
    expected_active.extend(more.iter().cloned());
    assert_eq!(read_ids(journal.path()).await, expected_active);
}

#[tokio::test]
async fn test_replay_spans_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Journal::open(rotation_config(dir.path()), HealthMonitor::new())
        .await
        .unwrap();

    let mut intent = JournalEntry::terminal("open-1", EntryStatus::Intent, None);
    intent.symbol = "BTCUSDT".to_string();
    journal.log_intent(intent).await.unwrap();
    commit_batch(&journal, "pre", 20).await;
    journal.commit_update("open-1", EntryStatus::Committed).await.unwrap();
    journal.flush().await.unwrap();

    let ledger = IntentLedger::replay(journal.path(), 2).await.unwrap();
    assert_eq!(ledger.len(), 21);
    assert_eq!(ledger.status("open-1"), Some(EntryStatus::Committed));
    assert_eq!(ledger.get("open-1").unwrap().symbol, "BTCUSDT");
    assert!(ledger.unresolved().is_empty());

    journal.close().await.unwrap();
}
