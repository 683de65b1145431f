//! Aleph Dispatch - Core Library
//! In-process event dispatch, admission control and position lifecycle engine

// Public modules
pub mod actor;
pub mod core;
pub mod dispatch;
pub mod message;
pub mod position;
pub mod system;

// Re-exports
pub use actor::{Actor, ActorId, ActorRuntime, ManagedActor};
pub use core::{Config, Error, Result};
pub use dispatch::{EventDispatcher, Handler, handler_fn};
pub use message::{Command, CommandStatus, Event, Message, MessageType, Payload, Query, Reply, Task};
pub use position::{PositionActor, PositionKey, PositionState};
pub use system::{SystemState, TradingSystem};
