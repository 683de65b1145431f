//! Position actor - drives the lifecycle state machine for one stream
//!
//! Each accepted transition emits a position event downstream so that
//! execution and portfolio collaborators can follow the lifecycle.

use anyhow::{Context, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::actor::Actor;
use crate::core::{Position, PositionSide, Symbol, Timeframe};
use crate::dispatch::EventDispatcher;
use crate::message::{Message, MessageType, Payload, Reply};
use crate::position::state_machine::{
    PositionHandlers, PositionKey, PositionState, PositionStateMachine,
};

pub struct PositionActor {
    name: String,
    symbol: Symbol,
    timeframe: Timeframe,
    dispatcher: Arc<EventDispatcher>,
    machine: PositionStateMachine,
    positions: Mutex<HashMap<PositionSide, Position>>,
}

impl PositionActor {
    pub fn new(symbol: Symbol, timeframe: Timeframe, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            name: format!("position_{}_{}", symbol, timeframe),
            symbol,
            timeframe,
            dispatcher,
            machine: PositionStateMachine::new(),
            positions: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self, side: PositionSide) -> PositionKey {
        PositionKey::new(self.symbol.clone(), self.timeframe, side)
    }

    pub fn state(&self, side: PositionSide) -> PositionState {
        self.machine.get(&self.key(side))
    }

    pub fn machine(&self) -> &PositionStateMachine {
        &self.machine
    }

    /// Position currently tracked for `side`, pending or open.
    pub fn position(&self, side: PositionSide) -> Option<Position> {
        self.positions.lock().get(&side).cloned()
    }

    fn tracked(&self, side: PositionSide) -> anyhow::Result<Position> {
        self.position(side)
            .with_context(|| format!("no tracked {} position for {}", side, self.name))
    }
}

/// Side a lifecycle payload applies to; `None` for payloads that hit both.
fn side_of(payload: &Payload) -> Option<PositionSide> {
    match payload {
        Payload::GoLongSignalReceived(_) | Payload::RiskLongThresholdBreached(_) => {
            Some(PositionSide::Long)
        }
        Payload::GoShortSignalReceived(_) | Payload::RiskShortThresholdBreached(_) => {
            Some(PositionSide::Short)
        }
        Payload::BrokerPositionOpened(p) | Payload::BrokerPositionClosed(p) => Some(p.side()),
        _ => None,
    }
}

#[async_trait]
impl Actor for PositionActor {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscriptions(&self) -> Vec<MessageType> {
        vec![
            MessageType::GoLongSignalReceived,
            MessageType::GoShortSignalReceived,
            MessageType::BrokerPositionOpened,
            MessageType::BrokerPositionClosed,
            MessageType::RiskLongThresholdBreached,
            MessageType::RiskShortThresholdBreached,
            MessageType::BacktestEnded,
            MessageType::GetPositionState,
        ]
    }

    fn pre_receive(&self, message: &Message) -> bool {
        let (symbol, timeframe) = message.payload().route();
        symbol == &self.symbol && timeframe == self.timeframe
    }

    async fn on_receive(&self, message: Arc<Message>) -> anyhow::Result<Reply> {
        let payload = message.payload();

        match payload {
            Payload::GetPositionState(request) => Ok(Reply::new(self.state(request.side))),
            Payload::BacktestEnded(_) => {
                // one side failing must not leave the other one open
                let mut first_err = None;
                for side in [PositionSide::Long, PositionSide::Short] {
                    let key = self.key(side);
                    if let Err(e) = self.machine.process_event(self, &key, payload).await {
                        warn!("Backtest end failed for {}: {:#}", key, e);
                        first_err.get_or_insert(e);
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(Reply::empty()),
                }
            }
            _ => {
                let Some(side) = side_of(payload) else {
                    return Ok(Reply::empty());
                };
                let state = self
                    .machine
                    .process_event(self, &self.key(side), payload)
                    .await?;
                Ok(Reply::new(state))
            }
        }
    }
}

#[async_trait]
impl PositionHandlers for PositionActor {
    async fn handle_signal_received(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool> {
        let signal = match payload {
            Payload::GoLongSignalReceived(s) | Payload::GoShortSignalReceived(s) => s,
            other => bail!("unexpected {:?} for {}", other.message_type(), key),
        };

        let position = Position::from_signal(signal.clone());
        self.positions.lock().insert(key.side, position.clone());
        self.dispatcher
            .publish(Payload::PositionInitialized(position))
            .await?;
        Ok(true)
    }

    async fn handle_position_opened(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool> {
        let Payload::BrokerPositionOpened(confirmed) = payload else {
            bail!("unexpected {:?} for {}", payload.message_type(), key);
        };

        let pending = self.tracked(key.side)?;
        if pending.size != confirmed.size {
            warn!(
                "{}: broker size {} differs from requested {}, keeping position pending",
                key, confirmed.size, pending.size
            );
            return Ok(false);
        }

        let opened = pending.open(confirmed.entry_price, confirmed.size);
        self.positions.lock().insert(key.side, opened.clone());
        self.dispatcher
            .publish(Payload::PositionOpened(opened))
            .await?;
        Ok(true)
    }

    async fn handle_position_closed(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool> {
        let Payload::BrokerPositionClosed(closed) = payload else {
            bail!("unexpected {:?} for {}", payload.message_type(), key);
        };

        self.positions.lock().remove(&key.side);
        self.dispatcher
            .publish(Payload::PositionClosed(closed.clone()))
            .await?;
        Ok(true)
    }

    async fn handle_exit_received(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool> {
        let breach = match payload {
            Payload::RiskLongThresholdBreached(b) | Payload::RiskShortThresholdBreached(b) => b,
            other => bail!("unexpected {:?} for {}", other.message_type(), key),
        };

        let mut position = self.tracked(key.side)?;
        position.exit_price = Some(breach.exit_price);
        self.dispatcher
            .publish(Payload::PositionCloseRequested(position))
            .await?;
        Ok(true)
    }

    async fn handle_backtest(&self, key: &PositionKey, payload: &Payload) -> anyhow::Result<bool> {
        let Payload::BacktestEnded(ended) = payload else {
            bail!("unexpected {:?} for {}", payload.message_type(), key);
        };

        let mut position = self.tracked(key.side)?;
        position.exit_price = Some(ended.exit_price);
        self.dispatcher
            .publish(Payload::PositionCloseRequested(position))
            .await?;
        Ok(true)
    }
}
