//! Actor runtime - lifecycle wrapper binding an actor's subscriptions to the
//! dispatcher

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

use crate::core::{Error, Result};
use crate::dispatch::{EventDispatcher, Filter, Handler};
use crate::message::{CommandStatus, Event, Message, MessageType, Payload, Reply};

pub type ActorId = Uuid;

#[async_trait]
pub trait Actor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Message types routed to `on_receive` while running.
    fn subscriptions(&self) -> Vec<MessageType>;

    /// Filter applied before `on_receive`; accepts everything by default.
    fn pre_receive(&self, _message: &Message) -> bool {
        true
    }

    async fn on_receive(&self, message: Arc<Message>) -> anyhow::Result<Reply>;

    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ActorHandler<A>(Arc<A>);

#[async_trait]
impl<A: Actor> Handler for ActorHandler<A> {
    async fn call(&self, message: Arc<Message>) -> anyhow::Result<Reply> {
        self.0.on_receive(message).await
    }
}

/// Object-safe view of a runtime, used by the trading system to manage
/// heterogeneous actors.
#[async_trait]
pub trait ManagedActor: Send + Sync {
    fn id(&self) -> ActorId;
    fn name(&self) -> &str;
    fn is_running(&self) -> bool;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub struct ActorRuntime<A: Actor> {
    id: ActorId,
    actor: Arc<A>,
    dispatcher: Arc<EventDispatcher>,
    lifecycle: tokio::sync::Mutex<()>,
    running: AtomicBool,
}

impl<A: Actor> ActorRuntime<A> {
    pub fn new(actor: A, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: Arc::new(actor),
            dispatcher,
            lifecycle: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn actor(&self) -> &Arc<A> {
        &self.actor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(Error::InvalidState(format!(
                "{} is already running",
                self.actor.name()
            )));
        }

        let handler: Arc<dyn Handler> = Arc::new(ActorHandler(self.actor.clone()));
        let actor = self.actor.clone();
        let filter: Filter = Arc::new(move |message: &Message| actor.pre_receive(message));

        let subscriptions = self.actor.subscriptions();
        for message_type in &subscriptions {
            self.dispatcher.register(
                *message_type,
                self.id,
                handler.clone(),
                Some(filter.clone()),
            );
        }

        if let Err(err) = self.actor.on_start().await {
            self.unregister_all(&subscriptions);
            return Err(Error::execution(&err));
        }

        self.running.store(true, Ordering::Release);
        info!("Actor {} started ({})", self.actor.name(), self.id);
        Ok(())
    }

    /// Unregisters immediately; messages already queued still run.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            return Err(Error::InvalidState(format!(
                "{} is not running",
                self.actor.name()
            )));
        }

        self.unregister_all(&self.actor.subscriptions());
        self.running.store(false, Ordering::Release);

        self.actor
            .on_stop()
            .await
            .map_err(|err| Error::execution(&err))?;

        info!("Actor {} stopped ({})", self.actor.name(), self.id);
        Ok(())
    }

    fn unregister_all(&self, subscriptions: &[MessageType]) {
        for message_type in subscriptions {
            self.dispatcher.unregister(*message_type, self.id);
        }
    }

    pub async fn tell(&self, event: Event) -> Result<()> {
        self.dispatcher.dispatch(event).await
    }

    pub async fn ask<R: Send + 'static>(&self, payload: Payload) -> Result<R> {
        self.dispatcher.query(payload).await
    }

    pub async fn execute(&self, payload: Payload) -> Result<CommandStatus> {
        self.dispatcher.execute(payload).await
    }
}

#[async_trait]
impl<A: Actor> ManagedActor for ActorRuntime<A> {
    fn id(&self) -> ActorId {
        self.id
    }

    fn name(&self) -> &str {
        self.actor.name()
    }

    fn is_running(&self) -> bool {
        ActorRuntime::is_running(self)
    }

    async fn start(&self) -> Result<()> {
        ActorRuntime::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        ActorRuntime::stop(self).await
    }
}
