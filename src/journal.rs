//! Intent journal - append-only JSON Lines write-ahead log
//!
//! Two write tiers share one file handle:
//! - `log_intent` writes and fsyncs on the caller's task before returning.
//!   A caller that gets an error must not contact the exchange.
//! - `commit_update` and `log_market_data` go through a bounded queue drained
//!   by a background flusher that batches writes (every tick or every
//!   `batch_size` entries, whichever comes first).
//!
//! The flusher checks the file size before each batch and rotates once the
//! ceiling is reached: `trade.wal` becomes `trade.<unix-ts>.wal` and a fresh
//! `trade.wal` is opened. Rotation and writes happen under the same lock, so
//! every entry lands in exactly one file.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::JournalConfig;
use crate::error::JournalError;
use crate::health::HealthMonitor;
use crate::types::{EntryStatus, JournalEntry};

enum Command {
    Append(JournalEntry),
    Flush(oneshot::Sender<Result<(), JournalError>>),
    Close(oneshot::Sender<Result<(), JournalError>>),
}

/// Owns the active file; every write and rotation happens through it
struct JournalWriter {
    path: PathBuf,
    file: Option<File>,
    max_bytes: u64,
    /// A previous write may have left a partial line behind
    torn: bool,
}

impl JournalWriter {
    async fn open(path: &Path, max_bytes: u64) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = open_append(path).await?;
        let torn = ends_mid_line(path).await?;
        if torn {
            warn!("Journal {} ends in a partial line, terminating it", path.display());
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            max_bytes,
            torn,
        })
    }

    /// Append whole lines. A failed write is truncated back so a retried
    /// batch never lands twice.
    async fn append(&mut self, bytes: &[u8]) -> Result<(), JournalError> {
        let file = self.file.as_mut().ok_or(JournalError::Closed)?;
        if self.torn {
            // Terminate the partial line so the next entry decodes on its own
            file.write_all(b"\n").await?;
            self.torn = false;
        }
        let start = file.metadata().await?.len();
        let written = match file.write_all(bytes).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.rollback(start).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Cut the file back to `len` after a failed write
    async fn rollback(&mut self, len: u64) {
        let Some(file) = self.file.as_mut() else { return };
        match file.set_len(len).await {
            Ok(()) => self.torn = false,
            Err(e) => {
                warn!("Journal truncate to {} bytes failed: {}", len, e);
                self.torn = true;
            }
        }
    }

    async fn sync(&mut self) -> Result<(), JournalError> {
        let file = self.file.as_mut().ok_or(JournalError::Closed)?;
        file.sync_all().await?;
        Ok(())
    }

    /// Rotate when the active file has reached the ceiling.
    /// Returns the rotated path when a rotation happened.
    async fn rotate_if_needed(&mut self) -> Result<Option<PathBuf>, JournalError> {
        let Some(file) = self.file.as_mut() else {
            return Err(JournalError::Closed);
        };
        let size = file.metadata().await?.len();
        if size < self.max_bytes {
            return Ok(None);
        }

        file.sync_all().await?;
        self.file = None;

        let rotated = rotated_path(&self.path, Utc::now().timestamp()).await;
        if let Err(source) = fs::rename(&self.path, &rotated).await {
            // Keep writing to the oversized file rather than stop journaling
            self.file = Some(open_append(&self.path).await?);
            return Err(JournalError::Rotation {
                path: rotated,
                source,
            });
        }

        self.file = Some(open_append(&self.path).await?);
        self.torn = false;
        info!(
            "Journal reached {} bytes, rotated to {}",
            size,
            rotated.display()
        );
        Ok(Some(rotated))
    }

    async fn close(&mut self) -> Result<(), JournalError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(path).await
}

/// Non-empty file whose last byte is not a newline
async fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

    let mut file = File::open(path).await?;
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// `dir/trade.wal` -> `dir/trade.<ts>.wal`, with a `-N` suffix on collision
async fn rotated_path(path: &Path, ts: i64) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("journal");
    let ext = path.extension().and_then(|s| s.to_str());
    let dir = path.parent().unwrap_or_else(|| Path::new(""));

    let mut n = 0u32;
    loop {
        let tag = if n == 0 { ts.to_string() } else { format!("{}-{}", ts, n) };
        let name = match ext {
            Some(ext) => format!("{}.{}.{}", stem, tag, ext),
            None => format!("{}.{}", stem, tag),
        };
        let candidate = dir.join(name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// Rotated siblings of `path`, oldest first
pub(crate) async fn rotated_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(Vec::new());
    };
    let ext = path.extension().and_then(|s| s.to_str());
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut found: Vec<((i64, u32), PathBuf)> = Vec::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(stem).and_then(|r| r.strip_prefix('.')) else {
            continue;
        };
        let tag = match ext {
            Some(ext) => match rest.strip_suffix(ext).and_then(|r| r.strip_suffix('.')) {
                Some(tag) => tag,
                None => continue,
            },
            None => rest,
        };
        if let Some(key) = parse_rotation_tag(tag) {
            found.push((key, entry.path()));
        }
    }
    found.sort_by_key(|(key, _)| *key);
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

fn parse_rotation_tag(tag: &str) -> Option<(i64, u32)> {
    match tag.split_once('-') {
        Some((ts, n)) => Some((ts.parse().ok()?, n.parse().ok()?)),
        None => Some((tag.parse().ok()?, 0)),
    }
}

/// State shared between the journal handle and its flusher task
struct Shared {
    degraded: AtomicBool,
    dropped_market_data: AtomicU64,
}

/// Durable intent journal
pub struct Journal {
    config: JournalConfig,
    writer: Arc<Mutex<JournalWriter>>,
    tx: mpsc::Sender<Command>,
    flusher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl Journal {
    /// Open (or create) the journal and start the background flusher
    pub async fn open(config: JournalConfig, health: HealthMonitor) -> Result<Self, JournalError> {
        let writer = JournalWriter::open(&config.path, config.max_file_bytes).await?;
        let writer = Arc::new(Mutex::new(writer));
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            degraded: AtomicBool::new(false),
            dropped_market_data: AtomicU64::new(0),
        });

        let flusher = Flusher {
            writer: Arc::clone(&writer),
            config: config.clone(),
            health,
            shared: Arc::clone(&shared),
            batch: Vec::with_capacity(config.batch_size),
            failures: 0,
        };
        let handle = tokio::spawn(flusher.run(rx));

        info!("Journal opened at {}", config.path.display());

        Ok(Self {
            config,
            writer,
            tx,
            flusher: parking_lot::Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
            shared,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Record an intent and fsync it before returning.
    ///
    /// Status is forced to `INTENT` and the timestamp to now.
    pub async fn log_intent(&self, mut entry: JournalEntry) -> Result<(), JournalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JournalError::Closed);
        }
        entry.status = EntryStatus::Intent;
        entry.timestamp = Utc::now();

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.append(&line).await?;
        writer.sync().await?;
        debug!("Intent {} for {} journaled", entry.id, entry.symbol);
        Ok(())
    }

    /// Queue a terminal status for an existing intent id
    pub async fn commit_update(&self, id: &str, status: EntryStatus) -> Result<(), JournalError> {
        self.resolve(id, status, None).await
    }

    /// Queue a terminal status with a diagnostic message
    pub async fn resolve(
        &self,
        id: &str,
        status: EntryStatus,
        message: Option<String>,
    ) -> Result<(), JournalError> {
        if !status.is_terminal() {
            warn!("Ignoring non-terminal status {} for intent {}", status, id);
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(JournalError::Closed);
        }
        let entry = JournalEntry::terminal(id, status, message);
        self.tx
            .send(Command::Append(entry))
            .await
            .map_err(|_| JournalError::Closed)
    }

    /// Best-effort diagnostic entry; dropped when the queue is full
    pub fn log_market_data(&self, symbol: &str, price: rust_decimal::Decimal, message: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let now = Utc::now();
        let entry = JournalEntry {
            id: format!("md_{}", now.timestamp_nanos_opt().unwrap_or_default()),
            symbol: symbol.to_string(),
            side: None,
            quantity: None,
            price: Some(price),
            status: EntryStatus::MarketData,
            timestamp: now,
            message: (!message.is_empty()).then(|| message.to_string()),
        };

        if self.tx.try_send(Command::Append(entry)).is_err() {
            let dropped = self.shared.dropped_market_data.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                warn!("Journal queue full, dropped {} market data entries", dropped);
            }
        }
    }

    /// Wait until everything queued before this call is on disk
    pub async fn flush(&self) -> Result<(), JournalError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| JournalError::Closed)?;
        done.await.map_err(|_| JournalError::Closed)?
    }

    /// Drain queued entries, sync and release the file
    pub async fn close(&self) -> Result<(), JournalError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (ack, done) = oneshot::channel();
        let result = match self.tx.send(Command::Close(ack)).await {
            Ok(()) => done.await.unwrap_or(Err(JournalError::Closed)),
            Err(_) => Err(JournalError::Closed),
        };

        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Journal flusher task failed: {}", e);
            }
        }
        info!("Journal closed");
        result
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Acquire)
    }

    pub fn dropped_market_data(&self) -> u64 {
        self.shared.dropped_market_data.load(Ordering::Relaxed)
    }
}

/// Background task draining the buffered tier
struct Flusher {
    writer: Arc<Mutex<JournalWriter>>,
    config: JournalConfig,
    health: HealthMonitor,
    shared: Arc<Shared>,
    batch: Vec<JournalEntry>,
    failures: u32,
}

impl Flusher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Append(entry)) => {
                        self.batch.push(entry);
                        if self.batch.len() >= self.config.batch_size.max(1) {
                            let _ = self.flush_batch().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        let _ = ack.send(self.flush_batch().await);
                    }
                    Some(Command::Close(ack)) => {
                        rx.close();
                        while let Ok(cmd) = rx.try_recv() {
                            match cmd {
                                Command::Append(entry) => self.batch.push(entry),
                                Command::Flush(pending) | Command::Close(pending) => {
                                    let _ = pending.send(Ok(()));
                                }
                            }
                        }
                        let result = self.shutdown().await;
                        let _ = ack.send(result);
                        return;
                    }
                    None => {
                        if let Err(e) = self.shutdown().await {
                            error!("Journal shutdown flush failed: {}", e);
                        }
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !self.batch.is_empty() {
                        let _ = self.flush_batch().await;
                    }
                }
            }
        }
    }

    async fn flush_batch(&mut self) -> Result<(), JournalError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(self.batch.len() * 128);
        for entry in &self.batch {
            match serde_json::to_vec(entry) {
                Ok(line) => {
                    buf.extend_from_slice(&line);
                    buf.push(b'\n');
                }
                Err(e) => error!("Dropping unencodable journal entry {}: {}", entry.id, e),
            }
        }

        let result = {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.rotate_if_needed().await {
                error!("Journal rotation check failed: {}", e);
            }
            match writer.append(&buf).await {
                Ok(()) => writer.sync().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                debug!("Flushed {} journal entries", self.batch.len());
                self.batch.clear();
                if self.failures > 0 {
                    self.failures = 0;
                    self.shared.degraded.store(false, Ordering::Release);
                    self.health.set_journal_status(false, 0);
                }
                Ok(())
            }
            Err(e) => {
                self.failures += 1;
                warn!(
                    "Journal flush of {} entries failed (attempt {}): {}",
                    self.batch.len(),
                    self.failures,
                    e
                );
                if self.failures >= self.config.degraded_after_failures {
                    self.shared.degraded.store(true, Ordering::Release);
                    self.health.set_journal_status(true, self.failures);
                }
                // Bound the retry backlog; the oldest entries go first
                let cap = self.config.queue_capacity.max(self.config.batch_size);
                if self.batch.len() > cap {
                    let excess = self.batch.len() - cap;
                    self.batch.drain(..excess);
                    warn!("Journal backlog over capacity, dropped {} entries", excess);
                }
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), JournalError> {
        let flushed = self.flush_batch().await;
        let closed = self.writer.lock().await.close().await;
        flushed.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> JournalConfig {
        JournalConfig {
            path: dir.join("trade.wal"),
            flush_interval_ms: 3_600_000,
            ..JournalConfig::default()
        }
    }

    async fn read_entries(path: &Path) -> Vec<JournalEntry> {
        let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_intent_is_on_disk_when_call_returns() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(test_config(dir.path()), HealthMonitor::new())
            .await
            .unwrap();

        let mut entry = JournalEntry::intent("t1", "BTCUSDT", crate::types::Side::Buy, Decimal::ONE);
        entry.status = EntryStatus::Committed;
        journal.log_intent(entry).await.unwrap();

        // Read without flushing or closing
        let entries = read_entries(journal.path()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "t1");
        assert_eq!(entries[0].status, EntryStatus::Intent);
    }

    #[tokio::test]
    async fn test_commit_update_lands_after_flush() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(test_config(dir.path()), HealthMonitor::new())
            .await
            .unwrap();

        journal
            .log_intent(JournalEntry::intent("t1", "ETHUSDT", crate::types::Side::Sell, Decimal::TEN))
            .await
            .unwrap();
        journal.commit_update("t1", EntryStatus::Committed).await.unwrap();
        assert_eq!(read_entries(journal.path()).await.len(), 1);

        journal.flush().await.unwrap();
        let entries = read_entries(journal.path()).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, EntryStatus::Committed);
    }

    #[tokio::test]
    async fn test_non_terminal_commit_is_ignored() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(test_config(dir.path()), HealthMonitor::new())
            .await
            .unwrap();

        journal.commit_update("t1", EntryStatus::Intent).await.unwrap();
        journal.flush().await.unwrap();
        assert!(read_entries(journal.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_drains_buffered_entries() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(test_config(dir.path()), HealthMonitor::new())
            .await
            .unwrap();

        for i in 0..20 {
            journal
                .commit_update(&format!("t{}", i), EntryStatus::Failed)
                .await
                .unwrap();
        }
        journal.close().await.unwrap();

        assert_eq!(read_entries(&dir.path().join("trade.wal")).await.len(), 20);
        assert!(matches!(
            journal
                .log_intent(JournalEntry::intent("late", "X", crate::types::Side::Buy, Decimal::ONE))
                .await,
            Err(JournalError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_batch_threshold_flushes_without_tick() {
        let dir = tempdir().unwrap();
        let config = JournalConfig {
            batch_size: 5,
            ..test_config(dir.path())
        };
        let journal = Journal::open(config, HealthMonitor::new()).await.unwrap();

        for i in 0..5 {
            journal
                .commit_update(&format!("t{}", i), EntryStatus::Committed)
                .await
                .unwrap();
        }

        let mut found = 0;
        for _ in 0..50 {
            found = read_entries(journal.path()).await.len();
            if found == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(found, 5);
    }

    #[tokio::test]
    async fn test_market_data_dropped_when_queue_full() {
        let dir = tempdir().unwrap();
        let config = JournalConfig {
            queue_capacity: 2,
            batch_size: 1,
            ..test_config(dir.path())
        };
        let journal = Journal::open(config, HealthMonitor::new()).await.unwrap();

        // Hold the file so the flusher stalls on its first batch
        let guard = journal.writer.lock().await;
        journal.log_market_data("BTCUSDT", Decimal::from(50_000), "tick");
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..10 {
            journal.log_market_data("BTCUSDT", Decimal::from(50_001), "");
        }
        let dropped = journal.dropped_market_data();
        assert!(dropped >= 8, "expected drops, got {}", dropped);
        drop(guard);

        journal.close().await.unwrap();
        let entries = read_entries(&dir.path().join("trade.wal")).await;
        assert_eq!(entries.len() as u64, 11 - dropped);
        assert!(entries.iter().all(|e| e.status == EntryStatus::MarketData));
    }

    #[tokio::test]
    async fn test_open_terminates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trade.wal");
        tokio::fs::write(&path, b"{\"id\":\"t0\",\"message\":\"caf\xC3").await.unwrap();

        let journal = Journal::open(test_config(dir.path()), HealthMonitor::new())
            .await
            .unwrap();
        journal
            .log_intent(JournalEntry::intent("t1", "BTCUSDT", crate::types::Side::Buy, Decimal::ONE))
            .await
            .unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        let lines: Vec<&[u8]> = content.split(|b| *b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        let entry: JournalEntry = serde_json::from_slice(lines[1]).unwrap();
        assert_eq!(entry.id, "t1");
    }

    #[tokio::test]
    async fn test_rollback_leaves_no_partial_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trade.wal");
        let mut writer = JournalWriter::open(&path, u64::MAX).await.unwrap();

        writer.append(b"{\"id\":\"a\"}\n").await.unwrap();
        let before = tokio::fs::metadata(&path).await.unwrap().len();

        // Half a batch reached the disk before the write failed
        let mut other = OpenOptions::new().append(true).open(&path).await.unwrap();
        other.write_all(b"{\"id\":\"b\"}\n{\"id\":\"c").await.unwrap();
        other.sync_all().await.unwrap();
        writer.rollback(before).await;

        writer.append(b"{\"id\":\"b\"}\n{\"id\":\"c\"}\n").await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "{\"id\":\"a\"}\n{\"id\":\"b\"}\n{\"id\":\"c\"}\n");
    }

    #[tokio::test]
    async fn test_rotated_file_listing_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trade.wal");
        for name in ["trade.wal", "trade.200.wal", "trade.100.wal", "trade.200-1.wal", "other.50.wal"] {
            tokio::fs::write(dir.path().join(name), b"").await.unwrap();
        }

        let files = rotated_files(&path).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["trade.100.wal", "trade.200.wal", "trade.200-1.wal"]);

        let next = rotated_path(&path, 200).await;
        assert_eq!(next.file_name().unwrap(), "trade.200-2.wal");
    }
}
