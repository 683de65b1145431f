//! Dispatch - registry, admission control and the worker pool

pub mod balancer;
pub mod dead_letter;
pub mod dedup;
pub mod dispatcher;
pub mod pid;
pub mod pool;
pub mod registry;
pub mod worker;

pub use balancer::LoadBalancer;
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use dispatcher::EventDispatcher;
pub use pool::WorkerPool;
pub use registry::{Filter, FnHandler, Handler, HandlerId, Registry, handler_fn};
