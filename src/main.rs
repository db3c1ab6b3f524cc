//! Trade Ledger - durability core of the trading agent
//!
//! 1. Opens the intent journal and restores the state snapshot
//! 2. Reconciles against the exchange before any trade is allowed
//! 3. Keeps auto-saving and soft-reconciling until ctrl-c

use std::sync::Arc;
use tracing::{error, info};

use trade_ledger::{HttpExchangeClient, ServiceRunner, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    // Initialize logging
    let level = settings
        .service
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting Trade Ledger...");
    info!(
        "Session: {}, journal: {}, exchange: {}",
        settings.service.session_id,
        settings.journal.path.display(),
        settings.exchange.base_url
    );

    let exchange = Arc::new(HttpExchangeClient::new(&settings.exchange)?);
    let mut runner = ServiceRunner::build(settings, exchange).await?;

    let interrupted = tokio::select! {
        report = runner.start() => {
            info!(
                "Startup reconciled: {} exchange positions, {} adopted",
                report.exchange_positions,
                report.ghosts.len()
            );
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        error!("Interrupted before startup reconciliation completed");
        return runner.shutdown().await;
    }

    tokio::signal::ctrl_c().await?;
    runner.shutdown().await
}
