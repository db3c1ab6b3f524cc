//! Core types for the intent journal, state snapshot and reconciler
//!
//! Status and side fields keep their string wire form (`"INTENT"`, `"BUY"`,
//! `"LONG"`) but are closed enums in memory, so an unknown value fails at
//! decode time instead of travelling through the system.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order direction as recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Position side this order opens
    pub fn opens(&self) -> PositionSide {
        match self {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of an open perpetual position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens a position of this side
    pub fn opening_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Order side that reduces/closes a position of this side
    pub fn closing_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }

    /// Side implied by a signed position amount (negative = short)
    pub fn from_signed(amount: Decimal) -> Self {
        if amount.is_sign_negative() {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle status of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// Recorded before the exchange call; outcome unknown until a terminal entry lands
    Intent,
    Committed,
    Failed,
    /// Diagnostic market data, never part of an intent lifecycle
    MarketData,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Committed | EntryStatus::Failed)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Intent => write!(f, "INTENT"),
            EntryStatus::Committed => write!(f, "COMMITTED"),
            EntryStatus::Failed => write!(f, "FAILED"),
            EntryStatus::MarketData => write!(f, "MARKET_DATA"),
        }
    }
}

/// One line of the journal file
///
/// Terminal entries written by `commit_update` carry only the id, status and
/// timestamp; the descriptive fields live on the original `INTENT` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Caller-supplied intent identifier, stable across the intent's lifetime
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, alias = "qty", skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub status: EntryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JournalEntry {
    /// New intent for an order about to be sent
    pub fn intent(id: impl Into<String>, symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            side: Some(side),
            quantity: Some(quantity),
            price: None,
            status: EntryStatus::Intent,
            timestamp: Utc::now(),
            message: None,
        }
    }

    /// Terminal record for an existing id
    pub fn terminal(id: impl Into<String>, status: EntryStatus, message: Option<String>) -> Self {
        Self {
            id: id.into(),
            symbol: String::new(),
            side: None,
            quantity: None,
            price: None,
            status,
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A position the process believes is open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Unset until protective orders are confirmed on the exchange
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub confidence: f64,
    /// Journal id of the intent that opened this position, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
}

impl PositionSnapshot {
    pub fn new(symbol: impl Into<String>, side: PositionSide, entry_price: Decimal, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price,
            quantity,
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
            confidence: 0.0,
            intent_id: None,
        }
    }

    /// Both protective levels are in place
    pub fn is_protected(&self) -> bool {
        self.stop_loss.is_some() && self.take_profit.is_some()
    }

    pub fn matches(&self, symbol: &str, side: PositionSide) -> bool {
        self.symbol == symbol && self.side == side
    }
}

/// Root object persisted by the state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub open_positions: Vec<PositionSnapshot>,
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    #[serde(default)]
    pub last_trade_id: String,
    #[serde(default)]
    pub market_regime: String,
}

impl StateSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            open_positions: Vec::new(),
            total_balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            last_trade_id: String::new(),
            market_regime: String::new(),
        }
    }
}

/// Live position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size; zero means no open position
    pub quantity: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Option<Decimal>,
}

impl ExchangePosition {
    /// Build from the signed amount exchanges usually report
    pub fn from_signed(symbol: impl Into<String>, amount: Decimal, entry_price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: PositionSide::from_signed(amount),
            quantity: amount.abs(),
            entry_price,
            unrealized_pnl: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.quantity.is_zero()
    }
}

/// Trigger level of a protective order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "price", rename_all = "snake_case")]
pub enum Trigger {
    StopLoss(Decimal),
    TakeProfit(Decimal),
}

impl Trigger {
    pub fn price(&self) -> Decimal {
        match self {
            Trigger::StopLoss(p) | Trigger::TakeProfit(p) => *p,
        }
    }
}

/// Reduce-only stop or take-profit order protecting an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    pub symbol: String,
    /// Closing side of the protected position
    pub side: Side,
    pub trigger: Trigger,
    pub quantity: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_wire_format() {
        let entry = JournalEntry::intent("t1", "BTCUSDT", Side::Buy, dec!(0.01));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "INTENT");
        assert_eq!(json["side"], "BUY");
        assert!(json.get("message").is_none());

        let md: EntryStatus = serde_json::from_str("\"MARKET_DATA\"").unwrap();
        assert_eq!(md, EntryStatus::MarketData);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let line = r#"{"id":"x","status":"PENDING","timestamp":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<JournalEntry>(line).is_err());
    }

    #[test]
    fn test_terminal_entry_decodes_without_descriptive_fields() {
        let line = r#"{"id":"t1","status":"COMMITTED","timestamp":"2024-01-01T00:00:00Z"}"#;
        let entry: JournalEntry = serde_json::from_str(line).unwrap();
        assert!(entry.status.is_terminal());
        assert!(entry.symbol.is_empty());
        assert!(entry.side.is_none());
    }

    #[test]
    fn test_legacy_qty_alias() {
        let line = r#"{"id":"t1","symbol":"ETHUSDT","side":"SELL","qty":"1.5","status":"INTENT","timestamp":"2024-01-01T00:00:00Z"}"#;
        let entry: JournalEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.quantity, Some(dec!(1.5)));
    }

    #[test]
    fn test_sides() {
        assert_eq!(Side::Buy.opens(), PositionSide::Long);
        assert_eq!(PositionSide::Short.closing_side(), Side::Buy);

        let pos = ExchangePosition::from_signed("SOLUSDT", dec!(-3), dec!(150));
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.quantity, dec!(3));
        assert!(pos.is_open());
    }
}
