//! Message taxonomy
//!
//! Four kinds of message travel through the dispatcher:
//!   - [`Event`]   fire-and-forget notification
//!   - [`Query`]   request expecting a typed reply
//!   - [`Command`] request expecting a success/failure status
//!   - [`Task`]    long-running unit of work with its own handle
//!
//! Replies travel through single-assignment slots backed by oneshot channels.
//! The producer keeps the receiving half (`Pending*`), the message carries the
//! sending half into the registry.

pub mod payload;
pub mod reply;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::{Error, Result};

pub use payload::{
    BacktestFinished, BrokerSettings, FeedRequest, MarketData, MessageGroup, MessageMeta,
    MessageType, Payload, PositionStateRequest, RiskBreach,
};
pub use reply::Reply;

/// Process-unique message id. Redelivered clones keep their id.
pub type MessageId = Uuid;

/// Handle of a spawned task; resolves to the handler's outcome.
pub type TaskHandle = JoinHandle<Result<Reply>>;

/// Outcome written into a command's status slot
#[derive(Debug, Clone)]
pub enum CommandStatus {
    Success,
    Fail(Error),
}

impl CommandStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Success)
    }
}

/// Write-once reply slot
pub struct Slot<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Slot<T> {
    fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// First writer wins. Returns false if the slot was already set or the
    /// caller stopped waiting.
    pub fn set(&self, value: T) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_set() { "Slot(set)" } else { "Slot(empty)" })
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: MessageId,
    pub meta: MessageMeta,
    pub payload: Payload,
}

impl Event {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            meta: payload.default_meta(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.meta.priority = priority;
        self
    }
}

#[derive(Debug)]
pub struct Query {
    pub id: MessageId,
    pub meta: MessageMeta,
    pub payload: Payload,
    pub(crate) slot: Slot<Result<Reply>>,
}

impl Query {
    pub fn new(payload: Payload) -> (Self, PendingReply) {
        let (slot, rx) = Slot::new();
        let pending = PendingReply {
            rx,
            label: format!("{:?}", payload.message_type()),
        };
        let query = Self {
            id: Uuid::new_v4(),
            meta: payload.default_meta(),
            payload,
            slot,
        };
        (query, pending)
    }

    pub fn set_response(&self, response: Result<Reply>) -> bool {
        self.slot.set(response)
    }
}

#[derive(Debug)]
pub struct Command {
    pub id: MessageId,
    pub meta: MessageMeta,
    pub payload: Payload,
    pub(crate) slot: Slot<CommandStatus>,
}

impl Command {
    pub fn new(payload: Payload) -> (Self, PendingStatus) {
        let (slot, rx) = Slot::new();
        let pending = PendingStatus {
            rx,
            label: format!("{:?}", payload.message_type()),
        };
        let command = Self {
            id: Uuid::new_v4(),
            meta: payload.default_meta(),
            payload,
            slot,
        };
        (command, pending)
    }

    pub fn executed(&self, status: CommandStatus) -> bool {
        self.slot.set(status)
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: MessageId,
    pub meta: MessageMeta,
    pub payload: Payload,
    pub(crate) slot: Slot<TaskHandle>,
}

impl Task {
    pub fn new(payload: Payload) -> (Self, PendingTask) {
        let (slot, rx) = Slot::new();
        let pending = PendingTask {
            rx,
            label: format!("{:?}", payload.message_type()),
        };
        let task = Self {
            id: Uuid::new_v4(),
            meta: payload.default_meta(),
            payload,
            slot,
        };
        (task, pending)
    }

    pub fn set_task(&self, handle: TaskHandle) -> bool {
        self.slot.set(handle)
    }
}

/// Closed set of message kinds
#[derive(Debug)]
pub enum Message {
    Event(Event),
    Query(Query),
    Command(Command),
    Task(Task),
}

/// Discriminant of [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Event,
    Query,
    Command,
    Task,
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Event(m) => m.id,
            Message::Query(m) => m.id,
            Message::Command(m) => m.id,
            Message::Task(m) => m.id,
        }
    }

    pub fn meta(&self) -> MessageMeta {
        match self {
            Message::Event(m) => m.meta,
            Message::Query(m) => m.meta,
            Message::Command(m) => m.meta,
            Message::Task(m) => m.meta,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Message::Event(m) => &m.payload,
            Message::Query(m) => &m.payload,
            Message::Command(m) => &m.payload,
            Message::Task(m) => &m.payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload().message_type()
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Event(_) => MessageKind::Event,
            Message::Query(_) => MessageKind::Query,
            Message::Command(_) => MessageKind::Command,
            Message::Task(_) => MessageKind::Task,
        }
    }

    pub fn priority(&self) -> u8 {
        self.meta().priority
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}<{:?}>#{} [p{} {}]",
            self.kind(),
            self.message_type(),
            self.id(),
            self.meta().priority,
            self.meta().group
        )
    }
}

impl From<Event> for Message {
    fn from(m: Event) -> Self {
        Message::Event(m)
    }
}

impl From<Query> for Message {
    fn from(m: Query) -> Self {
        Message::Query(m)
    }
}

impl From<Command> for Message {
    fn from(m: Command) -> Self {
        Message::Command(m)
    }
}

impl From<Task> for Message {
    fn from(m: Task) -> Self {
        Message::Task(m)
    }
}

/// Caller side of a query
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Reply>>,
    label: String,
}

impl PendingReply {
    /// Raw reply as written by the handler.
    pub async fn recv_raw(self) -> Result<Reply> {
        self.rx.await.map_err(|_| Error::NoReply(self.label))?
    }

    /// Reply downcast to the expected type.
    pub async fn recv<R: Send + 'static>(self) -> Result<R> {
        let label = self.label.clone();
        self.recv_raw()
            .await?
            .downcast::<R>()
            .map_err(|_| Error::ReplyType(label))
    }
}

/// Caller side of a command
#[derive(Debug)]
pub struct PendingStatus {
    rx: oneshot::Receiver<CommandStatus>,
    label: String,
}

impl PendingStatus {
    pub async fn recv(self) -> Result<CommandStatus> {
        self.rx.await.map_err(|_| Error::NoReply(self.label))
    }
}

/// Caller side of a task
#[derive(Debug)]
pub struct PendingTask {
    rx: oneshot::Receiver<TaskHandle>,
    label: String,
}

impl PendingTask {
    pub async fn recv(self) -> Result<TaskHandle> {
        self.rx.await.map_err(|_| Error::NoReply(self.label))
    }
}
