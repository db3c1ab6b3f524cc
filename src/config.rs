//! Service configuration
//!
//! Every field has a default so an empty environment yields a runnable
//! configuration. Values are read from an optional `trade-ledger.toml` and
//! overridden by `TRADE_LEDGER__<SECTION>__<KEY>` environment variables.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Retry budget for protective orders on adopted positions
    #[serde(default = "default_guard_retry")]
    pub guard_retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            journal: JournalConfig::default(),
            snapshot: SnapshotConfig::default(),
            reconciler: ReconcilerConfig::default(),
            exchange: ExchangeConfig::default(),
            retry: RetryConfig::default(),
            guard_retry: default_guard_retry(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Settings {
    /// Load from `trade-ledger.toml` (optional) and the environment
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(
            std::env::var("TRADE_LEDGER_CONFIG").unwrap_or_else(|_| "trade-ledger".to_string()),
        )
    }

    pub fn load_from(file: impl AsRef<str>) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("TRADE_LEDGER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Session identifier; names the snapshot file
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            session_id: default_session_id(),
            log_level: default_log_level(),
        }
    }
}

/// Intent journal settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
    /// Bounded queue for the buffered tier
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Flush once this many entries are batched
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush at least this often while entries are pending
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Rotate the active file once it reaches this size
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Consecutive buffered flush failures before the journal reports degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after_failures: u32,
    /// Active file plus this many newest rotated files are replayed on reconcile
    #[serde(default = "default_replay_files")]
    pub replay_files: usize,
}

impl JournalConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Preset for a separate high-volume market data journal
    pub fn market_data(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            queue_capacity: 5000,
            batch_size: 100,
            flush_interval_ms: 50,
            ..Self::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_file_bytes: default_max_file_bytes(),
            degraded_after_failures: default_degraded_after(),
            replay_files: default_replay_files(),
        }
    }
}

/// State snapshot settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_autosave_secs")]
    pub autosave_secs: u64,
}

impl SnapshotConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_secs.max(1))
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            autosave_secs: default_autosave_secs(),
        }
    }
}

/// Reconciler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_soft_interval_secs")]
    pub soft_interval_secs: u64,
    /// Age after which an unterminated intent is treated as dead
    #[serde(default = "default_stale_intent_grace_secs")]
    pub stale_intent_grace_secs: u64,
    /// Stop distance for adopted positions, as a fraction of the latest price
    #[serde(default = "default_emergency_stop_loss_pct")]
    pub emergency_stop_loss_pct: Decimal,
    #[serde(default = "default_emergency_take_profit_pct")]
    pub emergency_take_profit_pct: Decimal,
    /// Confidence recorded on adopted positions
    #[serde(default = "default_adopted_confidence")]
    pub adopted_confidence: f64,
    /// Pause between failed startup reconciliation attempts
    #[serde(default = "default_startup_retry_secs")]
    pub startup_retry_secs: u64,
}

impl ReconcilerConfig {
    pub fn soft_interval(&self) -> Duration {
        Duration::from_secs(self.soft_interval_secs.max(1))
    }

    pub fn stale_intent_grace(&self) -> Duration {
        Duration::from_secs(self.stale_intent_grace_secs)
    }

    pub fn startup_retry(&self) -> Duration {
        Duration::from_secs(self.startup_retry_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            soft_interval_secs: default_soft_interval_secs(),
            stale_intent_grace_secs: default_stale_intent_grace_secs(),
            emergency_stop_loss_pct: default_emergency_stop_loss_pct(),
            emergency_take_profit_pct: default_emergency_take_profit_pct(),
            adopted_confidence: default_adopted_confidence(),
            startup_retry_secs: default_startup_retry_secs(),
        }
    }
}

/// Exchange gateway settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_url")]
    pub base_url: String,
    /// Sent as a bearer token when present
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-call deadline
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl ExchangeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_exchange_url(),
            api_key: None,
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// Exponential backoff settings
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the delay randomised in both directions
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Successful probes needed in half-open before closing again
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

fn default_session_id() -> String { "default".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_journal_path() -> PathBuf { PathBuf::from("journal/trade.wal") }
fn default_queue_capacity() -> usize { 1000 }
fn default_batch_size() -> usize { 50 }
fn default_flush_interval_ms() -> u64 { 100 }
fn default_max_file_bytes() -> u64 { 50 * 1024 * 1024 }
fn default_degraded_after() -> u32 { 5 }
fn default_replay_files() -> usize { 2 }
fn default_state_dir() -> PathBuf { PathBuf::from("state") }
fn default_autosave_secs() -> u64 { 30 }
fn default_soft_interval_secs() -> u64 { 60 * 60 }
fn default_stale_intent_grace_secs() -> u64 { 10 * 60 }
fn default_emergency_stop_loss_pct() -> Decimal { Decimal::new(1, 2) }
fn default_emergency_take_profit_pct() -> Decimal { Decimal::new(2, 2) }
fn default_adopted_confidence() -> f64 { 0.85 }
fn default_startup_retry_secs() -> u64 { 5 }
fn default_exchange_url() -> String { "http://localhost:8090".to_string() }
fn default_call_timeout_secs() -> u64 { 10 }
fn default_max_retries() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 5_000 }
fn default_jitter() -> f64 { 0.2 }
fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout_secs() -> u64 { 30 }
fn default_half_open_probes() -> u32 { 3 }

fn default_guard_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 20,
        base_delay_ms: 500,
        max_delay_ms: 30_000,
        jitter: 0.2,
    }
}
