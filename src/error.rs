//! Error types for the durability and reconciliation core

use std::path::PathBuf;
use std::time::Duration;

/// Errors from the intent journal
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The entry may not be on disk; the caller must not contact the exchange
    #[error("journal write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("journal is closed")]
    Closed,

    #[error("journal rotation failed for {path}: {source}")]
    Rotation {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors from the state snapshot store
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("state file io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file exists but cannot be decoded. Never treated as a fresh start.
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("state encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from exchange calls
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("exchange call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by exchange")]
    RateLimited { retry_after: Option<Duration> },

    #[error("exchange network error: {0}")]
    Network(String),

    #[error("exchange server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("exchange rejected request: {0}")]
    Rejected(String),

    #[error("exchange authentication failed: {0}")]
    Auth(String),

    #[error("invalid exchange response: {0}")]
    InvalidResponse(String),

    #[error("exchange circuit breaker open, retry in {remaining:?}")]
    CircuitOpen { remaining: Duration },
}

impl ExchangeError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_)
                | ExchangeError::RateLimited { .. }
                | ExchangeError::Network(_)
                | ExchangeError::Server { .. }
                | ExchangeError::CircuitOpen { .. }
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ExchangeError::InvalidResponse(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

/// Errors that abort a reconciliation pass
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to fetch exchange positions: {0}")]
    Fetch(#[source] ExchangeError),

    #[error("failed to attach protective orders for {symbol}: {source}")]
    RiskAttachment {
        symbol: String,
        #[source]
        source: ExchangeError,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("reconciliation already in progress")]
    InProgress,
}

/// Errors on the trade path
#[derive(Debug, thiserror::Error)]
pub enum TradeError {
    /// Startup reconciliation has not completed yet
    #[error("trading disabled until startup reconciliation completes")]
    NotReconciled,

    /// The intent is not durable; the order was never sent
    #[error("intent not journaled, order not sent: {0}")]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The exchange confirmed the trade but the snapshot could not be saved.
    /// The next reconciliation will repair it.
    #[error("trade confirmed but snapshot not saved: {0}")]
    Snapshot(#[from] SnapshotError),
}
