//! Engine error model.
//!
//! Every failure that crosses the command pipeline is expressed as an
//! [`EngineError`]. The variants fall into three groups:
//!
//! - **Conflicts** (`OptimisticLocking`, `TransactionRetry`): another
//!   transaction won a race. Re-running the whole command from scratch is safe.
//! - **Fatal** (`FatalTransaction`, `Persistence`): the store rejected the work
//!   for a reason retrying will not fix.
//! - **Contract violations** (`NoActiveContext`, `MissingReference`,
//!   `InvalidArgument`): programming errors; they fail fast and are never retried.

use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A revision-guarded update or delete affected zero rows.
    #[error("optimistic locking failure: {0}")]
    OptimisticLocking(String),

    /// The store reported a serialization conflict; the transaction may be retried.
    #[error("retryable transaction conflict: {0}")]
    TransactionRetry(String),

    /// A commit or rollback failed for a non-retryable reason, or retries ran out.
    #[error("transaction failed: {0}")]
    FatalTransaction(String),

    /// An operation that requires an open command context ran outside one.
    #[error("no active command context: {0}")]
    NoActiveContext(String),

    /// A deferred value field points at a row that does not exist.
    #[error("missing referenced entity: {0}")]
    MissingReference(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Any other store failure.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A command failed with a business-level error.
    #[error("command failed: {0}")]
    Command(String),

    /// A job handler failed. `details` carries the full error report.
    #[error("job execution failed: {message}")]
    JobExecution { message: String, details: String },

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn optimistic_locking(msg: impl Into<String>) -> Self {
        Self::OptimisticLocking(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn no_active_context(operation: impl Into<String>) -> Self {
        Self::NoActiveContext(operation.into())
    }

    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, EngineError::OptimisticLocking(_))
    }

    pub fn is_retryable_transaction(&self) -> bool {
        matches!(self, EngineError::TransactionRetry(_))
    }

    /// True for failures caused by a competing transaction.
    pub fn is_conflict(&self) -> bool {
        self.is_optimistic_locking() || self.is_retryable_transaction()
    }

    /// Short human-readable message, without the variant prefix for job failures.
    pub fn message(&self) -> String {
        match self {
            EngineError::JobExecution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Full report stored as a job's exception stacktrace.
    pub fn details(&self) -> String {
        match self {
            EngineError::JobExecution { details, .. } => details.clone(),
            other => format!("{other:?}"),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::Serialization(value.to_string())
    }
}
