//! Error types for the coordination layer.

use crate::types::MailboxId;
use thiserror::Error;

/// Result type for coordination operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in coordination-layer operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Shared-state backend error.
    #[error("backend error: {0}")]
    Backend(#[from] mailstate_backend::BackendError),

    /// The cluster backend was unreachable at startup.
    ///
    /// Operating without cross-node mutual exclusion risks silent state
    /// corruption, so this is fatal: the caller must not fall back to
    /// local-only locking.
    #[error("cluster backend unreachable at startup: {message}")]
    ClusterUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// A mailbox lock could not be acquired within the wait bound.
    #[error("failed to acquire {mode} lock on {mailbox_id}: timed out")]
    LockTimeout {
        /// The mailbox whose lock was contended.
        mailbox_id: MailboxId,
        /// `"read"` or `"write"`.
        mode: &'static str,
    },

    /// Too many threads already queued on one mailbox lock.
    #[error("too many waiters on {mailbox_id} lock ({waiters} queued)")]
    LockQueueFull {
        /// The mailbox whose lock was contended.
        mailbox_id: MailboxId,
        /// Number of threads already waiting.
        waiters: usize,
    },

    /// The mailbox is in a maintenance window and the calling thread is not
    /// on the allow-list.
    #[error("{mailbox_id} is undergoing maintenance")]
    Maintenance {
        /// The mailbox under maintenance.
        mailbox_id: MailboxId,
    },

    /// Maintenance was started again without nesting enabled, or by a thread
    /// outside the allow-list.
    #[error("maintenance already active on {mailbox_id}: {message}")]
    MaintenanceAlreadyActive {
        /// The mailbox under maintenance.
        mailbox_id: MailboxId,
        /// Why the nested start was rejected.
        message: String,
    },

    /// A notification payload could not be decoded.
    #[error("malformed notification payload: {message}")]
    MalformedNotification {
        /// Description of the decode failure.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a fatal cluster-unavailable error.
    pub fn cluster_unavailable(message: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a malformed-notification error.
    pub fn malformed_notification(message: impl Into<String>) -> Self {
        Self::MalformedNotification {
            message: message.into(),
        }
    }

    /// True if this error marks a maintenance-window rejection.
    #[must_use]
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            Self::Maintenance { .. } | Self::MaintenanceAlreadyActive { .. }
        )
    }
}
