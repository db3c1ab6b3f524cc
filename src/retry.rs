//! Retry with exponential backoff and jitter for exchange calls

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ExchangeError;

/// Backoff schedule: `base * 2^attempt`, capped, +/- `jitter` fraction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once exhausted
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay(attempt))
    }

    /// Delay for `attempt` ignoring the retry budget, for loops that never
    /// give up
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        let mut delay = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());

        if self.jitter > 0.0 && delay > 0.0 {
            let range = delay * self.jitter;
            delay += rand::thread_rng().gen_range(-range..=range);
        }

        Duration::from_secs_f64(delay.max(0.0))
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: cfg.jitter.clamp(0.0, 1.0),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. Returns the last error in the latter cases.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                let Some(mut delay) = policy.backoff(attempt) else {
                    warn!("{} failed after {} retries: {}", label, attempt, e);
                    return Err(e);
                };
                // Honour the exchange's own hint when it asks for longer
                if let ExchangeError::RateLimited { retry_after: Some(after) } = &e {
                    delay = delay.max(*after);
                }
                warn!(
                    "{} failed (attempt {}): {}, retrying in {:?}",
                    label,
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
