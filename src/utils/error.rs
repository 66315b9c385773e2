//! The `error` module defines the error types returned by the `topicbus` broker.
//!
//! Every registry operation returns a precise [`BrokerError`] variant; there is
//! no catch-all failure. Failures raised by consumer handlers never surface
//! here: they are reported by the dispatch loop and counted per queue.

use std::fmt;

use thiserror::Error;

/// Kind of broker entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Exchange,
    Queue,
    Binding,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Exchange => f.write_str("exchange"),
            EntityKind::Queue => f.write_str("queue"),
            EntityKind::Binding => f.write_str("binding"),
        }
    }
}

/// Errors returned by [`Broker`](crate::broker::Broker) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Reference to an exchange, queue or binding that does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },

    /// Redeclaration with incompatible attributes, or a second consumer on an
    /// exclusive queue.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed topic pattern, routing key or entity name.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Queue buffer stayed full for longer than the publish timeout.
    #[error("queue '{queue}' is full (capacity {capacity})")]
    Capacity { queue: String, capacity: usize },

    /// A queue was declared with no tokio runtime to run its dispatch loop.
    #[error("no tokio runtime available for the queue dispatch loop")]
    NoRuntime,

    /// The broker has been shut down.
    #[error("broker is shut down")]
    Closed,
}

impl BrokerError {
    pub(crate) fn exchange_not_found(name: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind: EntityKind::Exchange,
            name: name.into(),
        }
    }

    pub(crate) fn queue_not_found(name: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind: EntityKind::Queue,
            name: name.into(),
        }
    }

    pub(crate) fn binding_not_found(name: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind: EntityKind::Binding,
            name: name.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
