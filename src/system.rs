//! Trading system lifecycle
//!
//! ```text
//! Idle       --change--> PreTrading   --stop--> Stopped
//! PreTrading --trading--> Trading     --stop--> Stopped
//! Trading    --change--> PreTrading   --stop--> Stopped
//! ```
//!
//! Deploying an actor queues it and signals `Change`. Entering `PreTrading`
//! starts every queued actor and flushes the dispatcher before moving on to
//! `Trading`.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::actor::ManagedActor;
use crate::core::{Error, Result};
use crate::dispatch::EventDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemState {
    Idle,
    PreTrading,
    Trading,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSignal {
    Change,
    Trading,
    Stop,
}

pub fn next_state(state: SystemState, signal: SystemSignal) -> Option<SystemState> {
    use SystemSignal as Sig;
    use SystemState as St;

    match (state, signal) {
        (St::Idle | St::Trading, Sig::Change) => Some(St::PreTrading),
        (St::PreTrading, Sig::Trading) => Some(St::Trading),
        (St::Idle | St::PreTrading | St::Trading, Sig::Stop) => Some(St::Stopped),
        _ => None,
    }
}

pub struct TradingSystem {
    dispatcher: Arc<EventDispatcher>,
    state: RwLock<SystemState>,
    queued: Mutex<Vec<Arc<dyn ManagedActor>>>,
    running: Mutex<Vec<Arc<dyn ManagedActor>>>,
    tx: flume::Sender<SystemSignal>,
    rx: flume::Receiver<SystemSignal>,
}

impl TradingSystem {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self {
            dispatcher,
            state: RwLock::new(SystemState::Idle),
            queued: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            tx,
            rx,
        })
    }

    pub fn state(&self) -> SystemState {
        *self.state.read()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn deploy(&self, actor: Arc<dyn ManagedActor>) -> Result<()> {
        if self.state() == SystemState::Stopped {
            return Err(Error::InvalidState("trading system is stopped".into()));
        }
        info!("Deploying actor {}", actor.name());
        self.queued.lock().push(actor);
        self.signal(SystemSignal::Change)
    }

    pub fn stop(&self) -> Result<()> {
        self.signal(SystemSignal::Stop)
    }

    fn signal(&self, signal: SystemSignal) -> Result<()> {
        self.tx.send(signal).map_err(|_| Error::Closed)
    }

    /// Drives the lifecycle until `Stopped`.
    pub async fn run(&self) -> Result<()> {
        while let Ok(signal) = self.rx.recv_async().await {
            let current = self.state();
            let Some(next) = next_state(current, signal) else {
                debug!("Ignoring {:?} in {:?}", signal, current);
                continue;
            };

            *self.state.write() = next;
            info!("Trading system: {:?} -> {:?}", current, next);

            match next {
                SystemState::PreTrading => self.enter_pre_trading().await?,
                SystemState::Trading => {
                    // an actor deployed while warming up missed the Change
                    if !self.queued.lock().is_empty() {
                        self.signal(SystemSignal::Change)?;
                    }
                }
                SystemState::Stopped => {
                    self.enter_stopped().await;
                    break;
                }
                SystemState::Idle => {}
            }
        }
        Ok(())
    }

    async fn enter_pre_trading(&self) -> Result<()> {
        let queued = std::mem::take(&mut *self.queued.lock());
        for actor in queued {
            actor.start().await?;
            self.running.lock().push(actor);
        }

        self.dispatcher.wait().await;
        self.signal(SystemSignal::Trading)
    }

    async fn enter_stopped(&self) {
        let running = std::mem::take(&mut *self.running.lock());
        for actor in running {
            if let Err(e) = actor.stop().await {
                warn!("Failed to stop {}: {}", actor.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorRuntime};
    use crate::core::Config;
    use crate::message::{Message, MessageType, Reply};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Idler;

    #[async_trait]
    impl Actor for Idler {
        fn name(&self) -> &str {
            "idler"
        }

        fn subscriptions(&self) -> Vec<MessageType> {
            vec![MessageType::NewMarketDataReceived]
        }

        async fn on_receive(&self, _message: Arc<Message>) -> anyhow::Result<Reply> {
            Ok(Reply::empty())
        }
    }

    async fn until_state(system: &TradingSystem, expected: SystemState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while system.state() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_transition_table() {
        use SystemSignal as Sig;
        use SystemState as St;

        assert_eq!(next_state(St::Idle, Sig::Change), Some(St::PreTrading));
        assert_eq!(next_state(St::Idle, Sig::Trading), None);
        assert_eq!(next_state(St::PreTrading, Sig::Trading), Some(St::Trading));
        assert_eq!(next_state(St::PreTrading, Sig::Change), None);
        assert_eq!(next_state(St::Trading, Sig::Change), Some(St::PreTrading));
        assert_eq!(next_state(St::Trading, Sig::Stop), Some(St::Stopped));
        assert_eq!(next_state(St::Stopped, Sig::Change), None);
    }

    #[tokio::test]
    async fn test_deploy_then_stop() {
        let dispatcher = EventDispatcher::new(&Config::default());
        let system = TradingSystem::new(dispatcher.clone());
        let actor: Arc<dyn ManagedActor> = Arc::new(ActorRuntime::new(Idler, dispatcher.clone()));

        let runner = {
            let system = system.clone();
            tokio::spawn(async move { system.run().await })
        };

        system.deploy(actor.clone()).unwrap();
        until_state(&system, SystemState::Trading).await;
        assert!(actor.is_running());

        system.stop().unwrap();
        runner.await.unwrap().unwrap();

        assert_eq!(system.state(), SystemState::Stopped);
        assert!(!actor.is_running());
        assert!(matches!(
            system.deploy(actor),
            Err(Error::InvalidState(_))
        ));
        dispatcher.shutdown().await;
    }
}
