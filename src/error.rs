//! Error types for the state registry and dispatch pipeline.
//!
//! Argument and disposal errors surface to the direct caller. Failures raised
//! by dispatched transforms or subscriber callbacks never reach this type;
//! they are logged and isolated where they happen.

use thiserror::Error;

/// Errors that can occur in registry, queue, executor and dispatcher operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The registry or queue was disposed before the call.
    #[error("already disposed: {0}")]
    AlreadyDisposed(String),

    /// A name, key or argument was empty or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A wait was cancelled before it completed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A configuration-driven factory was used without configuration.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// A configuration document could not be parsed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A typed read found a value of a different type under the name.
    #[error("type mismatch for state {name}: expected {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    /// An operation was invoked in a lifecycle state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A dispatched work item was dropped or panicked before completing.
    #[error("aborted: {0}")]
    Aborted(String),
}

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Cancelled(_))
    }

    /// Returns true if this error reports a disposed component.
    pub fn is_disposed(&self) -> bool {
        matches!(self, StateError::AlreadyDisposed(_))
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Configuration(err.to_string())
    }
}
