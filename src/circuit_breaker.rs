//! Circuit breaker guarding exchange calls
//!
//! Closed: calls flow, consecutive failures are counted. Once the threshold is
//! reached the breaker opens and rejects calls until the recovery timeout has
//! elapsed, then lets a limited number of probes through (half-open). Enough
//! successful probes close it again; any failed probe re-opens it.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
}

/// Thread-safe breaker shared by every exchange call site
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_successes: 0,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Admit a call, or reject with the time left until the next probe
    pub fn acquire(&self) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                let recovery = self.config.recovery_timeout();
                if elapsed >= recovery {
                    info!("Circuit breaker '{}' half-open, probing", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(ExchangeError::CircuitOpen {
                        remaining: recovery - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_probes.max(1) {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(ExchangeError::CircuitOpen {
                        remaining: Duration::ZERO,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.half_open_successes >= self.config.half_open_probes.max(1) {
                info!("Circuit breaker '{}' closed", self.name);
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold.max(1),
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };
        if trip {
            warn!(
                "Circuit breaker '{}' opened after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_in_flight = 0;
            inner.half_open_successes = 0;
        }
    }

    /// Run one call through the breaker. Only transient errors count as
    /// failures; a rejected order says nothing about exchange health.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T, ExchangeError>
    where
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        self.acquire()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(e)
            }
        }
    }
}
