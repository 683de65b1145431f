//! Core types - Strong typing for the trading domain carried in message payloads

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tradeable symbol (e.g., "BTCUSDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Bar interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeframe::M1 => write!(f, "1m"),
            Timeframe::M5 => write!(f, "5m"),
            Timeframe::M15 => write!(f, "15m"),
            Timeframe::H1 => write!(f, "1h"),
            Timeframe::H4 => write!(f, "4h"),
            Timeframe::D1 => write!(f, "1d"),
        }
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Entry signal emitted by a strategy collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub side: PositionSide,
    pub strategy: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        symbol: Symbol,
        timeframe: Timeframe,
        side: PositionSide,
        entry_price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            timeframe,
            side,
            strategy: "manual".to_string(),
            entry_price,
            size,
            stop_loss: None,
            take_profit: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_stops(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }
}

/// Position tracked through its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub signal: Signal,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Pending position sized from the signal; not yet confirmed by the broker.
    pub fn from_signal(signal: Signal) -> Self {
        Self {
            id: Uuid::new_v4(),
            size: signal.size,
            entry_price: signal.entry_price,
            signal,
            exit_price: None,
            opened_at: None,
            closed_at: None,
        }
    }

    pub fn side(&self) -> PositionSide {
        self.signal.side
    }

    pub fn symbol(&self) -> &Symbol {
        &self.signal.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.signal.timeframe
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some() && self.closed_at.is_none()
    }

    pub fn open(mut self, entry_price: Decimal, size: Decimal) -> Self {
        self.entry_price = entry_price;
        self.size = size;
        self.opened_at = Some(Utc::now());
        self
    }

    pub fn close(mut self, exit_price: Decimal) -> Self {
        self.exit_price = Some(exit_price);
        self.closed_at = Some(Utc::now());
        self
    }

    /// Realized PnL once an exit price is known.
    pub fn pnl(&self) -> Option<Decimal> {
        let exit = self.exit_price?;
        let diff = match self.side() {
            PositionSide::Long => exit - self.entry_price,
            PositionSide::Short => self.entry_price - exit,
        };
        Some(diff * self.size)
    }
}
