//! Health signals surfaced to the surrounding service

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Point-in-time health of the durability core
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    /// Buffered journal writes keep failing; terminal/market-data entries may be lost
    pub journal_degraded: bool,
    pub journal_flush_failures: u32,
    pub exchange_breaker_open: bool,
    /// Set once the startup reconciliation has succeeded; trading stays gated until then
    pub startup_reconciled: bool,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_reconcile_error: Option<String>,
    /// Adopted positions still waiting for protective orders
    pub unprotected_positions: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.startup_reconciled
            && !self.journal_degraded
            && !self.exchange_breaker_open
            && self.unprotected_positions == 0
    }
}

/// Shared, cloneable handle to the health report
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    inner: Arc<RwLock<HealthReport>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> HealthReport {
        self.inner.read().clone()
    }

    pub fn set_journal_status(&self, degraded: bool, failures: u32) {
        let mut report = self.inner.write();
        if degraded && !report.journal_degraded {
            error!("Journal degraded after {} consecutive flush failures", failures);
        } else if !degraded && report.journal_degraded {
            info!("Journal recovered");
        }
        report.journal_degraded = degraded;
        report.journal_flush_failures = failures;
    }

    pub fn set_breaker_open(&self, open: bool) {
        let mut report = self.inner.write();
        if open && !report.exchange_breaker_open {
            warn!("Exchange circuit breaker open");
        }
        report.exchange_breaker_open = open;
    }

    pub fn set_unprotected_positions(&self, count: usize) {
        self.inner.write().unprotected_positions = count;
    }

    pub fn mark_startup_reconciled(&self) {
        self.inner.write().startup_reconciled = true;
    }

    pub fn record_reconcile(&self, outcome: Result<(), String>) {
        let mut report = self.inner.write();
        report.last_reconcile_at = Some(Utc::now());
        report.last_reconcile_error = outcome.err();
    }
}
