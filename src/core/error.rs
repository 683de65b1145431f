//! Error handling - Hierarchical, cloneable dispatch errors

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Dispatch engine error hierarchy.
///
/// Errors are `Clone` because the same failure is written into a reply slot
/// and recorded in the dead-letter buffer.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Actor started twice or stopped while not running
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Handler exceeded the configured execution bound
    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// Handler returned an error or panicked
    #[error("Handler failed: {0}")]
    HandlerExecution(String),

    /// Priority group index outside the configured range
    #[error("Invalid priority group: {0} (groups: {1})")]
    InvalidPriorityGroup(usize, usize),

    /// No handler answered a query or command
    #[error("No reply for {0}")]
    NoReply(String),

    /// Reply value had a different type than the caller expected
    #[error("Unexpected reply type for {0}")]
    ReplyType(String),

    /// Dispatcher has been shut down
    #[error("Dispatcher closed")]
    Closed,

    /// Configuration errors
    #[error("Config: {0}")]
    Config(String),
}

impl Error {
    /// Wraps a handler-level `anyhow` error.
    pub fn execution(err: &anyhow::Error) -> Self {
        Self::HandlerExecution(format!("{err:#}"))
    }
}
