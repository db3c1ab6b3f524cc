//! Intent ledger - the journal replayed into one current status per intent id

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::error::JournalError;
use crate::journal::rotated_files;
use crate::types::{EntryStatus, JournalEntry, PositionSide, Side};

/// Current view of one intent id
#[derive(Debug, Clone, PartialEq)]
pub struct IntentRecord {
    pub id: String,
    pub symbol: String,
    pub side: Option<Side>,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    /// Status of the entry with the latest timestamp
    pub status: EntryStatus,
    /// When the INTENT line was written, if it was seen
    pub intent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub message: Option<String>,
}

impl IntentRecord {
    pub fn is_unresolved(&self) -> bool {
        self.status == EntryStatus::Intent
    }

    /// Position side this intent would open
    pub fn opens(&self) -> Option<PositionSide> {
        self.side.map(|s| s.opens())
    }

    /// Time since the intent was written
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let since = self.intent_at.unwrap_or(self.updated_at);
        (now - since).to_std().unwrap_or_default()
    }
}

/// Finalization status for an intent
#[derive(Debug, Clone, PartialEq)]
pub enum IntentFinalization {
    Pending,
    Committed { message: Option<String> },
    Failed { message: Option<String> },
}

impl IntentFinalization {
    pub fn is_finalized(&self) -> bool {
        !matches!(self, IntentFinalization::Pending)
    }
}

/// Latest-status-per-id view of the journal
#[derive(Debug, Clone, Default)]
pub struct IntentLedger {
    records: HashMap<String, IntentRecord>,
    skipped_lines: usize,
}

impl IntentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = JournalEntry>) -> Self {
        let mut ledger = Self::new();
        for entry in entries {
            ledger.apply(entry);
        }
        ledger
    }

    /// Replay the active journal plus up to `rotated` of its newest rotated files
    pub async fn replay(path: &Path, rotated: usize) -> Result<Self, JournalError> {
        let mut files = rotated_files(path).await?;
        let keep = files.len().saturating_sub(rotated);
        files.drain(..keep);
        files.push(path.to_path_buf());

        let mut ledger = Self::new();
        for file in &files {
            ledger.replay_file(file).await?;
        }

        if ledger.skipped_lines > 0 {
            warn!(
                "Skipped {} undecodable journal lines during replay",
                ledger.skipped_lines
            );
        }
        debug!(
            "Replayed {} journal files into {} intents",
            files.len(),
            ledger.records.len()
        );
        Ok(ledger)
    }

    async fn replay_file(&mut self, path: &Path) -> Result<(), JournalError> {
        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        // Raw bytes: a torn line may end inside a multi-byte character
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<JournalEntry>(&line) {
                Ok(entry) => self.apply(entry),
                // Torn tail from a crash mid-write, or a foreign line
                Err(_) => self.skipped_lines += 1,
            }
        }
        Ok(())
    }

    /// Fold one entry in. The latest timestamp wins; on a tie the entry seen
    /// last wins, which matches file order.
    pub fn apply(&mut self, entry: JournalEntry) {
        if entry.status == EntryStatus::MarketData {
            return;
        }

        let record = self
            .records
            .entry(entry.id.clone())
            .or_insert_with(|| IntentRecord {
                id: entry.id.clone(),
                symbol: String::new(),
                side: None,
                quantity: None,
                price: None,
                status: entry.status,
                intent_at: None,
                updated_at: entry.timestamp,
                message: None,
            });

        // Descriptive fields only appear on INTENT lines; keep the first seen
        if record.symbol.is_empty() && !entry.symbol.is_empty() {
            record.symbol = entry.symbol.clone();
        }
        if record.side.is_none() {
            record.side = entry.side;
        }
        if record.quantity.is_none() {
            record.quantity = entry.quantity;
        }
        if record.price.is_none() {
            record.price = entry.price;
        }
        if entry.status == EntryStatus::Intent {
            let first = record.intent_at.map_or(entry.timestamp, |t| t.min(entry.timestamp));
            record.intent_at = Some(first);
        }

        if entry.timestamp >= record.updated_at {
            record.status = entry.status;
            record.updated_at = entry.timestamp;
            record.message = entry.message;
        }
    }

    /// Record a terminal status we just wrote, without re-reading the file
    pub fn mark_resolved(&mut self, id: &str, status: EntryStatus, message: Option<String>) {
        self.apply(JournalEntry::terminal(id, status, message));
    }

    pub fn get(&self, id: &str) -> Option<&IntentRecord> {
        self.records.get(id)
    }

    pub fn status(&self, id: &str) -> Option<EntryStatus> {
        self.records.get(id).map(|r| r.status)
    }

    pub fn finalization(&self, id: &str) -> Option<IntentFinalization> {
        self.records.get(id).map(|r| match r.status {
            EntryStatus::Committed => IntentFinalization::Committed {
                message: r.message.clone(),
            },
            EntryStatus::Failed => IntentFinalization::Failed {
                message: r.message.clone(),
            },
            _ => IntentFinalization::Pending,
        })
    }

    /// Intents whose latest status is still INTENT, oldest first
    pub fn unresolved(&self) -> Vec<&IntentRecord> {
        let mut open: Vec<_> = self.records.values().filter(|r| r.is_unresolved()).collect();
        open.sort_by(|a, b| a.intent_at.cmp(&b.intent_at).then_with(|| a.id.cmp(&b.id)));
        open
    }

    /// Newest unresolved intent that would open `side` on `symbol`. An intent
    /// recorded without a side matches either.
    pub fn unresolved_opening(&self, symbol: &str, side: PositionSide) -> Option<&IntentRecord> {
        self.unresolved()
            .into_iter()
            .filter(|r| r.symbol == symbol && r.opens().map_or(true, |s| s == side))
            .last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }
}
