//! Event dispatcher - the facade actors and producers talk to
//!
//! Owns the registry and the worker pool. Queries, commands and tasks are
//! built here so callers get their pending half back in one call.

use std::sync::Arc;
use tracing::info;

use crate::core::config::DispatcherConfig;
use crate::core::{Config, Result};
use crate::dispatch::balancer::LoadBalancer;
use crate::dispatch::dead_letter::DeadLetter;
use crate::dispatch::pool::WorkerPool;
use crate::dispatch::registry::{Filter, Handler, HandlerId, Registry};
use crate::message::{
    Command, CommandStatus, Event, Message, MessageType, Payload, Query, Task, TaskHandle,
};

pub struct EventDispatcher {
    registry: Arc<Registry>,
    pool: WorkerPool,
}

impl EventDispatcher {
    pub fn new(config: &Config) -> Arc<Self> {
        let balancer = LoadBalancer::new(config.dispatcher.priority_groups, &config.balancer);
        Self::with_balancer(&config.dispatcher, balancer)
    }

    /// Builds a dispatcher around an explicitly constructed admission controller.
    pub fn with_balancer(config: &DispatcherConfig, balancer: LoadBalancer) -> Arc<Self> {
        let registry = Arc::new(Registry::new(
            config.handler_timeout(),
            config.dead_letter_capacity,
        ));
        let pool = WorkerPool::new(config, registry.clone(), balancer);

        info!(
            "Dispatcher ready (handler timeout {:?}, dead letters {})",
            config.handler_timeout(),
            config.dead_letter_capacity
        );

        Arc::new(Self { registry, pool })
    }

    pub fn register(
        &self,
        message_type: MessageType,
        id: HandlerId,
        handler: Arc<dyn Handler>,
        filter: Option<Filter>,
    ) {
        self.registry.register(message_type, id, handler, filter);
    }

    pub fn unregister(&self, message_type: MessageType, id: HandlerId) -> bool {
        self.registry.unregister(message_type, id)
    }

    pub async fn dispatch(&self, message: impl Into<Message>) -> Result<()> {
        self.pool.dispatch_to_worker(Arc::new(message.into())).await
    }

    /// Publishes `payload` as an event with its default metadata.
    pub async fn publish(&self, payload: Payload) -> Result<()> {
        self.dispatch(Event::new(payload)).await
    }

    /// Dispatches a query and waits for the typed reply.
    pub async fn query<R: Send + 'static>(&self, payload: Payload) -> Result<R> {
        let (query, pending) = Query::new(payload);
        self.dispatch(query).await?;
        pending.recv::<R>().await
    }

    pub async fn execute(&self, payload: Payload) -> Result<CommandStatus> {
        let (command, pending) = Command::new(payload);
        self.dispatch(command).await?;
        pending.recv().await
    }

    /// Returns once a worker has started the task; await the handle for the outcome.
    pub async fn run_task(&self, payload: Payload) -> Result<TaskHandle> {
        let (task, pending) = Task::new(payload);
        self.dispatch(task).await?;
        pending.recv().await
    }

    /// Resolves once every dispatched message has been handled.
    pub async fn wait(&self) {
        self.pool.wait().await;
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.registry.dead_letters()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
