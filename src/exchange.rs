//! Exchange seam consumed by the reconciler
//!
//! `ExchangeClient` is the raw collaborator. `GuardedExchange` is what the core
//! actually calls: every request gets a deadline, goes through the circuit
//! breaker and is retried with backoff when the failure is transient.

use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::health::HealthMonitor;
use crate::retry::{retry, RetryPolicy};
use crate::types::{ExchangePosition, ProtectiveOrder};

/// Result type for exchange operations
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Perpetual-futures exchange as seen by the durability core
#[async_trait::async_trait]
pub trait ExchangeClient: Send + Sync {
    /// All positions currently open on the account
    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>>;

    /// Place a reduce-only stop-loss or take-profit order
    async fn place_protective_order(&self, order: &ProtectiveOrder) -> Result<()>;

    /// Last traded / mark price for a symbol
    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal>;

    /// Client name for logs
    fn name(&self) -> &str;
}

/// REST client for the exchange gateway
pub struct HttpExchangeClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
}

impl HttpExchangeClient {
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.call_timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Map non-success statuses onto the retryable / permanent split
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => ExchangeError::RateLimited { retry_after },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Auth(body),
            s if s.is_server_error() => ExchangeError::Server {
                status: s.as_u16(),
                body,
            },
            s => ExchangeError::Rejected(format!("{} - {}", s, body)),
        })
    }
}

#[async_trait::async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>> {
        let response = self.request(reqwest::Method::GET, "/positions").send().await?;
        let positions: Vec<ExchangePosition> = Self::check(response).await?.json().await?;
        debug!("Exchange reported {} positions", positions.len());
        Ok(positions)
    }

    async fn place_protective_order(&self, order: &ProtectiveOrder) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/orders/protective")
            .json(order)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal> {
        let path = format!("/prices/{}", symbol);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let price: PriceResponse = Self::check(response).await?.json().await?;
        if price.price <= Decimal::ZERO {
            return Err(ExchangeError::InvalidResponse(format!(
                "non-positive price {} for {}",
                price.price, symbol
            )));
        }
        Ok(price.price)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Exchange client wrapped in deadline, circuit breaker and retry
#[derive(Clone)]
pub struct GuardedExchange {
    client: Arc<dyn ExchangeClient>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
    health: HealthMonitor,
}

impl GuardedExchange {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        breaker: Arc<CircuitBreaker>,
        call_timeout: Duration,
        health: HealthMonitor,
    ) -> Self {
        Self {
            client,
            breaker,
            call_timeout,
            health,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn get_open_positions(&self, policy: &RetryPolicy) -> Result<Vec<ExchangePosition>> {
        let client = Arc::clone(&self.client);
        self.guard(policy, "get_open_positions", move || {
            let client = Arc::clone(&client);
            async move { client.get_open_positions().await }
        })
        .await
    }

    pub async fn get_latest_price(&self, symbol: &str, policy: &RetryPolicy) -> Result<Decimal> {
        let client = Arc::clone(&self.client);
        let label = format!("get_latest_price({})", symbol);
        self.guard(policy, &label, move || {
            let client = Arc::clone(&client);
            let symbol = symbol.to_string();
            async move { client.get_latest_price(&symbol).await }
        })
        .await
    }

    pub async fn place_protective_order(&self, order: &ProtectiveOrder, policy: &RetryPolicy) -> Result<()> {
        let client = Arc::clone(&self.client);
        let label = format!("place_protective_order({})", order.symbol);
        self.guard(policy, &label, move || {
            let client = Arc::clone(&client);
            let order = order.clone();
            async move { client.place_protective_order(&order).await }
        })
        .await
    }

    async fn guard<T, F, Fut>(&self, policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.call_timeout;
        let breaker = &self.breaker;

        let result = retry(policy, label, move || {
            let fut = op();
            async move {
                breaker
                    .call(async move {
                        tokio::time::timeout(deadline, fut)
                            .await
                            .unwrap_or_else(|_| Err(ExchangeError::Timeout(deadline)))
                    })
                    .await
            }
        })
        .await;

        self.health.set_breaker_open(self.breaker.is_open());
        result
    }
}
