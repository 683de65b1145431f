//! Payload catalog - every message body the engine routes
//!
//! The registry is keyed by [`MessageType`], the fieldless discriminant of
//! [`Payload`]. Adding a payload means adding a variant to both enums; the
//! compiler points at every `match` that has to learn about it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::{Ohlcv, Position, PositionSide, Signal, Symbol, Timeframe};

/// Coarse origin of a message, used for logging and metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageGroup {
    Market,
    Signal,
    Risk,
    Position,
    Broker,
    Backtest,
    Feed,
}

impl std::fmt::Display for MessageGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageGroup::Market => "market",
            MessageGroup::Signal => "signal",
            MessageGroup::Risk => "risk",
            MessageGroup::Position => "position",
            MessageGroup::Broker => "broker",
            MessageGroup::Backtest => "backtest",
            MessageGroup::Feed => "feed",
        };
        f.write_str(name)
    }
}

/// Routing metadata. Priority 1 is the most important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub priority: u8,
    pub group: MessageGroup,
}

impl MessageMeta {
    pub const fn new(priority: u8, group: MessageGroup) -> Self {
        Self { priority, group }
    }
}

/// Registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    GoLongSignalReceived,
    GoShortSignalReceived,
    BrokerPositionOpened,
    BrokerPositionClosed,
    RiskLongThresholdBreached,
    RiskShortThresholdBreached,
    BacktestEnded,
    NewMarketDataReceived,
    PositionInitialized,
    PositionOpened,
    PositionCloseRequested,
    PositionClosed,
    GetPositionState,
    UpdateSettings,
    StartRealtimeFeed,
}

/// Risk collaborator decided the position must be exited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBreach {
    pub position: Position,
    pub ohlcv: Ohlcv,
    pub exit_price: Decimal,
}

/// Backtest replay finished for a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestFinished {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub exit_price: Decimal,
}

/// New bar from the feed collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub ohlcv: Ohlcv,
}

/// Read of one position lifecycle slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionStateRequest {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub side: PositionSide,
}

/// Broker account settings for a symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub leverage: u32,
}

/// Long-running realtime feed for a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    GoLongSignalReceived(Signal),
    GoShortSignalReceived(Signal),
    BrokerPositionOpened(Position),
    BrokerPositionClosed(Position),
    RiskLongThresholdBreached(RiskBreach),
    RiskShortThresholdBreached(RiskBreach),
    BacktestEnded(BacktestFinished),
    NewMarketDataReceived(MarketData),
    PositionInitialized(Position),
    PositionOpened(Position),
    PositionCloseRequested(Position),
    PositionClosed(Position),
    GetPositionState(PositionStateRequest),
    UpdateSettings(BrokerSettings),
    StartRealtimeFeed(FeedRequest),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::GoLongSignalReceived(_) => MessageType::GoLongSignalReceived,
            Payload::GoShortSignalReceived(_) => MessageType::GoShortSignalReceived,
            Payload::BrokerPositionOpened(_) => MessageType::BrokerPositionOpened,
            Payload::BrokerPositionClosed(_) => MessageType::BrokerPositionClosed,
            Payload::RiskLongThresholdBreached(_) => MessageType::RiskLongThresholdBreached,
            Payload::RiskShortThresholdBreached(_) => MessageType::RiskShortThresholdBreached,
            Payload::BacktestEnded(_) => MessageType::BacktestEnded,
            Payload::NewMarketDataReceived(_) => MessageType::NewMarketDataReceived,
            Payload::PositionInitialized(_) => MessageType::PositionInitialized,
            Payload::PositionOpened(_) => MessageType::PositionOpened,
            Payload::PositionCloseRequested(_) => MessageType::PositionCloseRequested,
            Payload::PositionClosed(_) => MessageType::PositionClosed,
            Payload::GetPositionState(_) => MessageType::GetPositionState,
            Payload::UpdateSettings(_) => MessageType::UpdateSettings,
            Payload::StartRealtimeFeed(_) => MessageType::StartRealtimeFeed,
        }
    }

    /// Metadata used when the producer does not override it.
    pub fn default_meta(&self) -> MessageMeta {
        match self {
            Payload::BrokerPositionOpened(_)
            | Payload::BrokerPositionClosed(_)
            | Payload::UpdateSettings(_) => MessageMeta::new(1, MessageGroup::Broker),
            Payload::RiskLongThresholdBreached(_) | Payload::RiskShortThresholdBreached(_) => {
                MessageMeta::new(1, MessageGroup::Risk)
            }
            Payload::GoLongSignalReceived(_) | Payload::GoShortSignalReceived(_) => {
                MessageMeta::new(2, MessageGroup::Signal)
            }
            Payload::PositionInitialized(_)
            | Payload::PositionOpened(_)
            | Payload::PositionCloseRequested(_)
            | Payload::PositionClosed(_) => MessageMeta::new(2, MessageGroup::Position),
            Payload::StartRealtimeFeed(_) => MessageMeta::new(2, MessageGroup::Feed),
            Payload::NewMarketDataReceived(_) => MessageMeta::new(3, MessageGroup::Market),
            Payload::GetPositionState(_) => MessageMeta::new(3, MessageGroup::Position),
            Payload::BacktestEnded(_) => MessageMeta::new(4, MessageGroup::Backtest),
        }
    }

    /// Stream the payload belongs to, used by actor filters.
    pub fn route(&self) -> (&Symbol, Timeframe) {
        match self {
            Payload::GoLongSignalReceived(s) | Payload::GoShortSignalReceived(s) => {
                (&s.symbol, s.timeframe)
            }
            Payload::BrokerPositionOpened(p)
            | Payload::BrokerPositionClosed(p)
            | Payload::PositionInitialized(p)
            | Payload::PositionOpened(p)
            | Payload::PositionCloseRequested(p)
            | Payload::PositionClosed(p) => (p.symbol(), p.timeframe()),
            Payload::RiskLongThresholdBreached(r) | Payload::RiskShortThresholdBreached(r) => {
                (r.position.symbol(), r.position.timeframe())
            }
            Payload::BacktestEnded(b) => (&b.symbol, b.timeframe),
            Payload::NewMarketDataReceived(m) => (&m.symbol, m.timeframe),
            Payload::GetPositionState(q) => (&q.symbol, q.timeframe),
            Payload::UpdateSettings(s) => (&s.symbol, s.timeframe),
            Payload::StartRealtimeFeed(f) => (&f.symbol, f.timeframe),
        }
    }
}
