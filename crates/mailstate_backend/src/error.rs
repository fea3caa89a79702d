//! Error types for shared-state backends.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur in shared-state backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend is unreachable or refused the operation.
    #[error("backend unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// A key was used with the wrong value kind (scalar vs hash vs counter).
    #[error("wrong kind for key '{key}': {message}")]
    WrongKind {
        /// The offending key.
        key: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A distributed mutex could not be acquired within the wait bound.
    #[error("timed out waiting for mutex '{name}'")]
    MutexTimeout {
        /// Name of the mutex.
        name: String,
    },

    /// A mutex release was attempted with a handle that no longer owns it.
    #[error("mutex '{name}' not held by this handle")]
    MutexNotHeld {
        /// Name of the mutex.
        name: String,
    },

    /// A subscription id did not refer to a live subscription.
    #[error("unknown subscription: {id}")]
    UnknownSubscription {
        /// The stale subscription id.
        id: u64,
    },
}

impl BackendError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a wrong-kind error.
    pub fn wrong_kind(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WrongKind {
            key: key.into(),
            message: message.into(),
        }
    }
}
