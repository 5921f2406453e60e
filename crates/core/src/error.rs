//! Error taxonomy of the batch subsystem.
//!
//! Configuration errors, recoverable store conflicts, operational failures and
//! business failures are distinct variants so that retry decisions are made by
//! matching on the error kind, never on message text.

use thiserror::Error;

/// Result type used across the batch subsystem.
pub type BatchResult<T> = Result<T, BatchError>;

/// Error raised by a transactional store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Serialization failure or deadlock. The only error class a job retries.
    #[error("serialization conflict: {0}")]
    Conflict(String),

    /// Connectivity or other infrastructure failure.
    #[error("operational error: {0}")]
    Operational(String),

    /// A write was attempted inside a read-only scope.
    #[error("read-only transaction: {0}")]
    ReadOnly(String),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn operational(msg: impl Into<String>) -> Self {
        Self::Operational(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Error raised by a task broker or telemetry sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("broker serialization error: {0}")]
    Serialization(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),
}

/// Error of a batch, job or async-method operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The name does not resolve to a registered operation.
    #[error("not found: {0}")]
    NotFound(String),

    /// The name resolves to a model that is not a batch.
    #[error("{0} is not a batch operation")]
    NotBatch(String),

    /// A precondition of the request does not hold (fatal, never retried).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A parameter is missing or malformed.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Business failure raised by an operation.
    #[error("operation failed: {0}")]
    Operation(String),

    /// Records already have a pending background task.
    #[error("the records below have pending background tasks:\n\n{}\n\nPlease wait for the tasks to complete.", names.join("\n"))]
    PendingTasks { names: Vec<String> },

    /// A logged job cannot be split into single-record jobs.
    #[error("job {0} cannot be split")]
    NotSplittable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BatchError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn invalid_param(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn operation(msg: impl Into<String>) -> Self {
        Self::Operation(msg.into())
    }

    /// Whether this error is a store serialization conflict.
    pub fn is_recoverable_conflict(&self) -> bool {
        matches!(self, BatchError::Store(StoreError::Conflict(_)))
    }

    /// Whether this error is an operational (infrastructure) store failure.
    pub fn is_operational(&self) -> bool {
        matches!(self, BatchError::Store(StoreError::Operational(_)))
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
