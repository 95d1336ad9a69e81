//! Error taxonomy for the event backbone.
//!
//! Every fallible operation in the crate returns [`EventError`]. The variants
//! fall into a few families:
//!
//! - **Malformed input**: [`EventError::InvalidEvent`], [`EventError::InvalidConfig`]
//! - **Policy rejections**: [`EventError::Unauthenticated`], [`EventError::RateLimited`],
//!   [`EventError::CircuitOpen`]
//! - **Backpressure / lifecycle**: [`EventError::QueueFull`], [`EventError::PoolStopped`],
//!   [`EventError::Cancelled`]
//! - **Handler outcomes**: [`EventError::HandlerFailed`], [`EventError::HandlerExecution`],
//!   [`EventError::Timeout`]
//! - **Broker**: [`EventError::BrokerUnavailable`], [`EventError::BatchFailed`]

use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EventError>;

/// A single handler's failure inside an aggregated fan-out error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Name of the handler that failed
    pub handler: String,
    /// Rendered error message
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.handler, self.message)
    }
}

/// One item of a batch that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Subject (or event type, for local delivery) of the failed item
    pub subject: String,
    pub message: String,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

/// Errors produced by the bus, dispatcher, worker pool, middleware and broker bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    /// The envelope is malformed (missing id/type/timestamp or timestamp out of range)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A non-system event arrived without an actor identity
    #[error("Unauthenticated event: {0}")]
    Unauthenticated(String),

    /// The actor exhausted its token bucket
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The circuit for this event type is open
    #[error("Circuit open for event type: {0}")]
    CircuitOpen(String),

    /// A bounded queue had no free slot
    #[error("Queue full")]
    QueueFull,

    /// The pool or dispatcher is shutting down
    #[error("Worker pool stopped")]
    PoolStopped,

    /// One or more handlers failed during fan-out
    #[error("{} handler(s) failed: {}", .0.len(), join_failures(.0))]
    HandlerFailed(Vec<HandlerFailure>),

    /// A single handler or processor failed
    #[error("Handler execution error: {0}")]
    HandlerExecution(String),

    /// The external broker could not be reached or rejected the operation
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Some items of a batch failed; the others were delivered and are not retracted
    #[error("{} batch item(s) failed: {}", .0.len(), join_failures(.0))]
    BatchFailed(Vec<BatchFailure>),

    /// `(event type, handler name)` is already registered
    #[error("Handler '{handler}' already registered for event type '{event_type}'")]
    DuplicateHandler { event_type: String, handler: String },

    /// No such `(event type, handler name)` registration
    #[error("Handler '{handler}' not registered for event type '{event_type}'")]
    HandlerNotFound { event_type: String, handler: String },

    /// A processing attempt exceeded its deadline
    #[error("Processing timed out after {0} ms")]
    Timeout(u64),

    /// The caller's context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration values are out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn join_failures<F: fmt::Display>(failures: &[F]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl EventError {
    /// Whether the error is a synchronous policy rejection from the middleware chain.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            EventError::Unauthenticated(_) | EventError::RateLimited(_) | EventError::CircuitOpen(_)
        )
    }
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
