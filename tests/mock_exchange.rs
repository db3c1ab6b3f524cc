//! Mocked ExchangeClient for testing without a live exchange

#![allow(dead_code)]

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use trade_ledger::{ExchangeClient, ExchangeError, ExchangePosition, PositionSide, ProtectiveOrder};

#[derive(Default)]
struct MockState {
    positions: Vec<ExchangePosition>,
    prices: HashMap<String, Decimal>,
    orders: Vec<ProtectiveOrder>,
    position_calls: u32,
    /// Next N position fetches fail with a network error
    fail_positions: u32,
    /// Next N protective orders fail with a transient server error
    fail_orders: u32,
    /// Every protective order is rejected
    reject_orders: bool,
}

/// In-memory exchange that records protective orders
#[derive(Clone, Default)]
pub struct MockExchange {
    state: Arc<Mutex<MockState>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(self, symbol: &str, side: PositionSide, quantity: Decimal, entry: Decimal) -> Self {
        self.open(symbol, side, quantity, entry);
        self
    }

    pub fn with_price(self, symbol: &str, price: Decimal) -> Self {
        self.state.lock().unwrap().prices.insert(symbol.to_string(), price);
        self
    }

    pub fn open(&self, symbol: &str, side: PositionSide, quantity: Decimal, entry: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.positions.retain(|p| !(p.symbol == symbol && p.side == side));
        state.positions.push(ExchangePosition {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: entry,
            unrealized_pnl: None,
        });
    }

    pub fn close(&self, symbol: &str) {
        self.state.lock().unwrap().positions.retain(|p| p.symbol != symbol);
    }

    pub fn fail_position_fetches(&self, times: u32) {
        self.state.lock().unwrap().fail_positions = times;
    }

    pub fn fail_orders(&self, times: u32) {
        self.state.lock().unwrap().fail_orders = times;
    }

    pub fn reject_orders(&self, reject: bool) {
        self.state.lock().unwrap().reject_orders = reject;
    }

    pub fn orders(&self) -> Vec<ProtectiveOrder> {
        self.state.lock().unwrap().orders.clone()
    }

    pub fn orders_for(&self, symbol: &str) -> Vec<ProtectiveOrder> {
        self.orders().into_iter().filter(|o| o.symbol == symbol).collect()
    }

    pub fn position_calls(&self) -> u32 {
        self.state.lock().unwrap().position_calls
    }
}

#[async_trait::async_trait]
impl ExchangeClient for MockExchange {
    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.position_calls += 1;
        if state.fail_positions > 0 {
            state.fail_positions -= 1;
            return Err(ExchangeError::Network("connection reset".to_string()));
        }
        Ok(state.positions.clone())
    }

    async fn place_protective_order(&self, order: &ProtectiveOrder) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_orders {
            return Err(ExchangeError::Rejected("reduce-only order rejected".to_string()));
        }
        if state.fail_orders > 0 {
            state.fail_orders -= 1;
            return Err(ExchangeError::Server {
                status: 503,
                body: "busy".to_string(),
            });
        }
        state.orders.push(order.clone());
        Ok(())
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let state = self.state.lock().unwrap();
        state
            .prices
            .get(symbol)
            .copied()
            .or_else(|| {
                state
                    .positions
                    .iter()
                    .find(|p| p.symbol == symbol)
                    .map(|p| p.entry_price)
            })
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("no price for {}", symbol)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
