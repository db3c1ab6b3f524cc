//! Trade Ledger Library
//!
//! Durability and reconciliation core for a perpetual-futures trading agent:
//! a write-ahead intent journal, an atomically persisted state snapshot and a
//! reconciler that aligns both with the exchange.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod exchange;
pub mod health;
pub mod intent;
pub mod journal;
pub mod reconciler;
pub mod retry;
pub mod runner;
pub mod state;
pub mod trade;
pub mod types;

// Re-export main types for convenience
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use config::{
    CircuitBreakerConfig, ExchangeConfig, JournalConfig, ReconcilerConfig, RetryConfig,
    ServiceConfig, Settings, SnapshotConfig,
};
pub use error::{ExchangeError, JournalError, ReconcileError, SnapshotError, TradeError};
pub use exchange::{ExchangeClient, GuardedExchange, HttpExchangeClient};
pub use health::{HealthMonitor, HealthReport};
pub use intent::{IntentFinalization, IntentLedger, IntentRecord};
pub use journal::Journal;
pub use reconciler::{GhostOutcome, GhostState, ReconcileReport, Reconciler};
pub use retry::RetryPolicy;
pub use runner::ServiceRunner;
pub use state::SnapshotStore;
pub use trade::{new_intent_id, TradeRecorder};
pub use types::{
    EntryStatus, ExchangePosition, JournalEntry, PositionSide, PositionSnapshot, ProtectiveOrder,
    Side, StateSnapshot, Trigger,
};
