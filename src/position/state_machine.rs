//! Position lifecycle state machine
//!
//! One state per (symbol, timeframe, side). Transitions are a closed table:
//!
//! ```text
//! Idle                      --signal received-->        WaitingBrokerConfirmation
//! WaitingBrokerConfirmation --broker opened-->          Opened
//! WaitingBrokerConfirmation --broker closed-->          Idle
//! WaitingBrokerConfirmation --backtest ended-->         Close
//! Opened                    --risk threshold breach-->  Close
//! Opened                    --backtest ended-->         Close
//! Close                     --broker closed-->          Idle
//! ```
//!
//! Any other (state, message) pair is ignored. The read, the handler and the
//! write run under a per-key async lock, so two workers delivering messages for
//! the same key can never interleave.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{PositionSide, Symbol, Timeframe};
use crate::message::{MessageType, Payload};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    #[default]
    Idle,
    WaitingBrokerConfirmation,
    Opened,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: Symbol, timeframe: Timeframe, side: PositionSide) -> Self {
        Self {
            symbol,
            timeframe,
            side,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.symbol, self.timeframe, self.side)
    }
}

/// Which handler guards a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionHandler {
    SignalReceived,
    PositionOpened,
    PositionClosed,
    ExitReceived,
    Backtest,
}

pub fn transition(
    state: PositionState,
    message_type: MessageType,
) -> Option<(PositionState, TransitionHandler)> {
    use MessageType as M;
    use PositionState as S;
    use TransitionHandler as H;

    match (state, message_type) {
        (S::Idle, M::GoLongSignalReceived | M::GoShortSignalReceived) => {
            Some((S::WaitingBrokerConfirmation, H::SignalReceived))
        }
        (S::WaitingBrokerConfirmation, M::BrokerPositionOpened) => {
            Some((S::Opened, H::PositionOpened))
        }
        (S::WaitingBrokerConfirmation, M::BrokerPositionClosed) => {
            Some((S::Idle, H::PositionClosed))
        }
        (S::WaitingBrokerConfirmation | S::Opened, M::BacktestEnded) => {
            Some((S::Close, H::Backtest))
        }
        (S::Opened, M::RiskLongThresholdBreached | M::RiskShortThresholdBreached) => {
            Some((S::Close, H::ExitReceived))
        }
        (S::Close, M::BrokerPositionClosed) => Some((S::Idle, H::PositionClosed)),
        _ => None,
    }
}

/// Guards invoked on transitions. `Ok(true)` commits the next state,
/// `Ok(false)` vetoes it, `Err` leaves the state unchanged and propagates.
#[async_trait]
pub trait PositionHandlers: Send + Sync {
    async fn handle_signal_received(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool>;

    async fn handle_position_opened(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool>;

    async fn handle_position_closed(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool>;

    async fn handle_exit_received(
        &self,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<bool>;

    async fn handle_backtest(&self, key: &PositionKey, payload: &Payload) -> anyhow::Result<bool>;
}

#[derive(Default)]
pub struct PositionStateMachine {
    states: RwLock<HashMap<PositionKey, PositionState>>,
    guards: Mutex<HashMap<PositionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PositionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `payload` to `key` and returns the resulting state.
    pub async fn process_event<H>(
        &self,
        handlers: &H,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<PositionState>
    where
        H: PositionHandlers + ?Sized,
    {
        let guard = self.guard(key);
        let outcome = {
            let _lock = guard.lock().await;
            self.apply(handlers, key, payload).await
        };
        self.release(key, guard);
        outcome
    }

    async fn apply<H>(
        &self,
        handlers: &H,
        key: &PositionKey,
        payload: &Payload,
    ) -> anyhow::Result<PositionState>
    where
        H: PositionHandlers + ?Sized,
    {
        let current = self.get(key);
        let message_type = payload.message_type();

        let Some((next, handler)) = transition(current, message_type) else {
            debug!("No transition for {} in {:?} on {:?}", key, current, message_type);
            return Ok(current);
        };

        let accepted = match handler {
            TransitionHandler::SignalReceived => {
                handlers.handle_signal_received(key, payload).await?
            }
            TransitionHandler::PositionOpened => {
                handlers.handle_position_opened(key, payload).await?
            }
            TransitionHandler::PositionClosed => {
                handlers.handle_position_closed(key, payload).await?
            }
            TransitionHandler::ExitReceived => handlers.handle_exit_received(key, payload).await?,
            TransitionHandler::Backtest => handlers.handle_backtest(key, payload).await?,
        };

        if !accepted {
            debug!("{:?} vetoed {} {:?} -> {:?}", handler, key, current, next);
            return Ok(current);
        }

        self.states.write().insert(key.clone(), next);
        info!("{}: {:?} -> {:?}", key, current, next);
        Ok(next)
    }

    fn guard(&self, key: &PositionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.guards.lock().entry(key.clone()).or_default().clone()
    }

    /// Drops the key's guard once no other caller holds or waits on it.
    /// Clones only happen under the map lock, so the count is stable here.
    fn release(&self, key: &PositionKey, guard: Arc<tokio::sync::Mutex<()>>) {
        let mut guards = self.guards.lock();
        if Arc::strong_count(&guard) == 2 {
            guards.remove(key);
        }
    }

    /// Keys with a live per-key guard.
    pub fn active_guards(&self) -> usize {
        self.guards.lock().len()
    }

    pub fn get(&self, key: &PositionKey) -> PositionState {
        self.states.read().get(key).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<PositionKey, PositionState> {
        self.states.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ohlcv, Position, Signal};
    use crate::message::{BacktestFinished, RiskBreach};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        fail_signal: bool,
        veto_open: bool,
        delay: Option<Duration>,
    }

    impl Recorder {
        async fn record(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PositionHandlers for Recorder {
        async fn handle_signal_received(&self, _: &PositionKey, _: &Payload) -> anyhow::Result<bool> {
            self.record().await;
            if self.fail_signal {
                anyhow::bail!("signal rejected");
            }
            Ok(true)
        }

        async fn handle_position_opened(&self, _: &PositionKey, _: &Payload) -> anyhow::Result<bool> {
            self.record().await;
            Ok(!self.veto_open)
        }

        async fn handle_position_closed(&self, _: &PositionKey, _: &Payload) -> anyhow::Result<bool> {
            self.record().await;
            Ok(true)
        }

        async fn handle_exit_received(&self, _: &PositionKey, _: &Payload) -> anyhow::Result<bool> {
            self.record().await;
            Ok(true)
        }

        async fn handle_backtest(&self, _: &PositionKey, _: &Payload) -> anyhow::Result<bool> {
            self.record().await;
            Ok(true)
        }
    }

    fn key(symbol: &str) -> PositionKey {
        PositionKey::new(Symbol::new(symbol), Timeframe::H1, PositionSide::Long)
    }

    fn signal(symbol: &str) -> Signal {
        Signal::new(
            Symbol::new(symbol),
            Timeframe::H1,
            PositionSide::Long,
            Decimal::from(100),
            Decimal::ONE,
        )
    }

    fn go_long(symbol: &str) -> Payload {
        Payload::GoLongSignalReceived(signal(symbol))
    }

    fn position(symbol: &str) -> Position {
        Position::from_signal(signal(symbol)).open(Decimal::from(100), Decimal::ONE)
    }

    fn risk_breach(symbol: &str) -> Payload {
        Payload::RiskLongThresholdBreached(RiskBreach {
            position: position(symbol),
            ohlcv: Ohlcv {
                timestamp: Utc::now(),
                open: Decimal::from(100),
                high: Decimal::from(101),
                low: Decimal::from(90),
                close: Decimal::from(91),
                volume: Decimal::from(10),
            },
            exit_price: Decimal::from(91),
        })
    }

    #[test]
    fn test_transition_table() {
        use MessageType as M;
        use PositionState as S;

        assert_eq!(
            transition(S::Idle, M::GoShortSignalReceived),
            Some((S::WaitingBrokerConfirmation, TransitionHandler::SignalReceived))
        );
        assert_eq!(
            transition(S::Close, M::BrokerPositionClosed),
            Some((S::Idle, TransitionHandler::PositionClosed))
        );
        assert_eq!(transition(S::Idle, M::BrokerPositionClosed), None);
        assert_eq!(transition(S::Opened, M::GoLongSignalReceived), None);
        assert_eq!(transition(S::Close, M::BacktestEnded), None);
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let fsm = PositionStateMachine::new();
        let handlers = Recorder::default();
        let k = key("BTCUSDT");

        let steps = [
            (go_long("BTCUSDT"), PositionState::WaitingBrokerConfirmation),
            (Payload::BrokerPositionOpened(position("BTCUSDT")), PositionState::Opened),
            (risk_breach("BTCUSDT"), PositionState::Close),
            (Payload::BrokerPositionClosed(position("BTCUSDT")), PositionState::Idle),
        ];
        for (payload, expected) in steps {
            assert_eq!(fsm.process_event(&handlers, &k, &payload).await.unwrap(), expected);
        }
        assert_eq!(handlers.calls.load(Ordering::SeqCst), 4);
        assert_eq!(fsm.active_guards(), 0);
    }

    #[tokio::test]
    async fn test_undefined_pair_is_noop() {
        let fsm = PositionStateMachine::new();
        let handlers = Recorder::default();
        let k = key("BTCUSDT");

        let state = fsm
            .process_event(&handlers, &k, &Payload::BrokerPositionClosed(position("BTCUSDT")))
            .await
            .unwrap();

        assert_eq!(state, PositionState::Idle);
        assert_eq!(handlers.calls.load(Ordering::SeqCst), 0);
        assert!(fsm.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_keeps_state() {
        let fsm = PositionStateMachine::new();
        let handlers = Recorder {
            fail_signal: true,
            ..Recorder::default()
        };
        let k = key("BTCUSDT");

        let err = fsm
            .process_event(&handlers, &k, &go_long("BTCUSDT"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("signal rejected"));
        assert_eq!(fsm.get(&k), PositionState::Idle);
        assert_eq!(fsm.active_guards(), 0);
    }

    #[tokio::test]
    async fn test_veto_keeps_state() {
        let fsm = PositionStateMachine::new();
        let handlers = Recorder {
            veto_open: true,
            ..Recorder::default()
        };
        let k = key("BTCUSDT");

        fsm.process_event(&handlers, &k, &go_long("BTCUSDT")).await.unwrap();
        let state = fsm
            .process_event(&handlers, &k, &Payload::BrokerPositionOpened(position("BTCUSDT")))
            .await
            .unwrap();

        assert_eq!(state, PositionState::WaitingBrokerConfirmation);
    }

    #[tokio::test]
    async fn test_backtest_closes_from_waiting() {
        let fsm = PositionStateMachine::new();
        let handlers = Recorder::default();
        let k = key("SOLUSDT");
        let ended = Payload::BacktestEnded(BacktestFinished {
            symbol: Symbol::new("SOLUSDT"),
            timeframe: Timeframe::H1,
            exit_price: Decimal::from(150),
        });

        fsm.process_event(&handlers, &k, &go_long("SOLUSDT")).await.unwrap();
        assert_eq!(
            fsm.process_event(&handlers, &k, &ended).await.unwrap(),
            PositionState::Close
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keys_are_isolated_under_concurrency() {
        let fsm = Arc::new(PositionStateMachine::new());
        let handlers = Arc::new(Recorder {
            delay: Some(Duration::from_millis(20)),
            ..Recorder::default()
        });

        let tasks: Vec<_> = ["BTCUSDT", "ETHUSDT"]
            .into_iter()
            .map(|symbol| {
                let fsm = fsm.clone();
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    let k = key(symbol);
                    fsm.process_event(handlers.as_ref(), &k, &go_long(symbol)).await?;
                    fsm.process_event(
                        handlers.as_ref(),
                        &k,
                        &Payload::BrokerPositionOpened(position(symbol)),
                    )
                    .await
                })
            })
            .collect();

        for outcome in futures::future::join_all(tasks).await {
            assert_eq!(outcome.unwrap().unwrap(), PositionState::Opened);
        }

        let snapshot = fsm.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&key("BTCUSDT")], PositionState::Opened);
        assert_eq!(snapshot[&key("ETHUSDT")], PositionState::Opened);
        assert_eq!(fsm.active_guards(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_transitions_once() {
        let fsm = Arc::new(PositionStateMachine::new());
        let handlers = Arc::new(Recorder {
            delay: Some(Duration::from_millis(20)),
            ..Recorder::default()
        });

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let fsm = fsm.clone();
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    fsm.process_event(handlers.as_ref(), &key("BTCUSDT"), &go_long("BTCUSDT"))
                        .await
                })
            })
            .collect();

        for outcome in futures::future::join_all(tasks).await {
            assert_eq!(
                outcome.unwrap().unwrap(),
                PositionState::WaitingBrokerConfirmation
            );
        }
        // only the first signal found Idle
        assert_eq!(handlers.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fsm.active_guards(), 0);
    }
}
