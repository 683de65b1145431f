//! Dispatch registry - message type → ordered (handler, filter) pairs
//!
//! Execution policy by kind:
//!   - Event / Query / Command: awaited under `timeout`; overrun is a failure
//!   - Task: spawned detached, its handle written into the task's slot
//!
//! Every failure lands in the dead-letter buffer and the error log. A failing
//! handler never stops the remaining handlers for the same message.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use crate::core::{Error, Result};
use crate::dispatch::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::message::{CommandStatus, Message, MessageType, Reply, TaskHandle};

/// Identifies a registration so it can be removed again
pub type HandlerId = Uuid;

/// Per-registration predicate; `false` skips the handler for that message
pub type Filter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, message: Arc<Message>) -> anyhow::Result<Reply>;
}

/// Adapter turning an async closure into a [`Handler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    async fn call(&self, message: Arc<Message>) -> anyhow::Result<Reply> {
        (self.0)(message).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    handler: Arc<dyn Handler>,
    filter: Option<Filter>,
}

impl Registration {
    fn accepts(&self, message: &Message) -> bool {
        self.filter.as_ref().is_none_or(|f| f(message))
    }
}

pub struct Registry {
    handlers: RwLock<HashMap<MessageType, Vec<Registration>>>,
    dead_letters: Arc<DeadLetterQueue>,
    timeout: Duration,
}

impl Registry {
    pub fn new(timeout: Duration, dead_letter_capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            dead_letters: Arc::new(DeadLetterQueue::new(dead_letter_capacity)),
            timeout,
        }
    }

    pub fn register(
        &self,
        message_type: MessageType,
        id: HandlerId,
        handler: Arc<dyn Handler>,
        filter: Option<Filter>,
    ) {
        self.handlers
            .write()
            .entry(message_type)
            .or_default()
            .push(Registration {
                id,
                handler,
                filter,
            });
    }

    /// Removes every registration of `id` for `message_type`.
    pub fn unregister(&self, message_type: MessageType, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(entries) = handlers.get_mut(&message_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|r| r.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(&message_type);
        }
        removed
    }

    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.handlers
            .read()
            .get(&message_type)
            .map_or(0, |entries| entries.len())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.snapshot()
    }

    pub fn dead_letter_queue(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Runs every matching handler in registration order.
    pub async fn handle(&self, message: Arc<Message>) {
        let entries = self
            .handlers
            .read()
            .get(&message.message_type())
            .cloned()
            .unwrap_or_default();

        if entries.is_empty() {
            debug!("No handler for {}", message);
            return;
        }

        for entry in entries.iter().filter(|r| r.accepts(&message)) {
            self.call_handler(entry, message.clone()).await;
        }
    }

    async fn call_handler(&self, entry: &Registration, message: Arc<Message>) {
        if let Message::Task(task) = message.as_ref() {
            task.set_task(self.spawn_task(entry, message.clone()));
            return;
        }

        match self.execute_bounded(entry, message.clone()).await {
            Ok(reply) => match message.as_ref() {
                Message::Query(query) => {
                    query.set_response(Ok(reply));
                }
                Message::Command(command) => {
                    command.executed(CommandStatus::Success);
                }
                Message::Event(_) | Message::Task(_) => {}
            },
            Err(err) => {
                match message.as_ref() {
                    Message::Query(query) => {
                        query.set_response(Err(err.clone()));
                    }
                    Message::Command(command) => {
                        command.executed(CommandStatus::Fail(err.clone()));
                    }
                    Message::Event(_) | Message::Task(_) => {}
                }
                record_failure(&self.dead_letters, entry.id, message, err);
            }
        }
    }

    async fn execute_bounded(&self, entry: &Registration, message: Arc<Message>) -> Result<Reply> {
        let call = AssertUnwindSafe(entry.handler.call(message)).catch_unwind();

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(err))) => Err(Error::execution(&err)),
            Ok(Err(panic)) => Err(Error::HandlerExecution(panic_message(panic))),
            Err(_) => Err(Error::HandlerTimeout(self.timeout)),
        }
    }

    /// Tasks are not bounded. A failing task resolves its handle to the real
    /// error and is dead-lettered when it finishes.
    fn spawn_task(&self, entry: &Registration, message: Arc<Message>) -> TaskHandle {
        let handler = entry.handler.clone();
        let handler_id = entry.id;
        let dead_letters = self.dead_letters.clone();

        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(handler.call(message.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(err)) => Error::execution(&err),
                Err(panic) => Error::HandlerExecution(panic_message(panic)),
            };
            record_failure(&dead_letters, handler_id, message, outcome.clone());
            Err(outcome)
        })
    }
}

fn record_failure(
    dead_letters: &DeadLetterQueue,
    handler_id: HandlerId,
    message: Arc<Message>,
    err: Error,
) {
    error!(
        "Exception encountered in {} (handler {}): {}. Message added to dead letter queue.",
        message, handler_id, err
    );
    dead_letters.push(message, err);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
