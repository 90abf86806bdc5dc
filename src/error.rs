//! Transfer error types
//!
//! Every failure is classified at the point it is raised. The handler reads
//! [`TransferError::is_retryable`] and never inspects message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TransferError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Object store unavailable: {0}")]
    ObjectStoreUnavailable(String),

    #[error("Object too large: {size} bytes exceeds ceiling of {limit} bytes")]
    ObjectTooLarge { size: u64, limit: u64 },

    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    #[error("Credential malformed: {0}")]
    CredentialMalformed(String),

    #[error("Credential store unavailable: {0}")]
    CredentialStoreUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("Transfer interrupted: {message}")]
    TransferInterrupted { message: String, retryable: bool },

    /// The server cannot rename; the handler falls back to direct writes.
    #[error("Atomic rename unsupported by remote: {0}")]
    AtomicRenameUnsupported(String),

    #[error("Deadline exceeded during {0}")]
    DeadlineExceeded(String),
}

impl TransferError {
    /// Interruption caused by a transient I/O condition.
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::TransferInterrupted {
            message: message.into(),
            retryable: true,
        }
    }

    /// Interruption caused by the remote refusing the operation.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::TransferInterrupted {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidEvent(_) => ErrorKind::InvalidEvent,
            TransferError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            TransferError::ObjectStoreUnavailable(_) => ErrorKind::ObjectStoreUnavailable,
            TransferError::ObjectTooLarge { .. } => ErrorKind::ObjectTooLarge,
            TransferError::CredentialNotFound(_) => ErrorKind::CredentialNotFound,
            TransferError::CredentialMalformed(_) => ErrorKind::CredentialMalformed,
            TransferError::CredentialStoreUnavailable(_) => ErrorKind::CredentialStoreUnavailable,
            TransferError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            TransferError::HostKeyRejected(_) => ErrorKind::HostKeyRejected,
            TransferError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            TransferError::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            TransferError::TransferInterrupted { retryable: true, .. } => {
                ErrorKind::TransferInterruptedRetryable
            }
            TransferError::TransferInterrupted { retryable: false, .. } => {
                ErrorKind::TransferInterruptedRejected
            }
            // Surfaced only if the fallback itself cannot run.
            TransferError::AtomicRenameUnsupported(_) => ErrorKind::TransferInterruptedRejected,
            TransferError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
        }
    }

    /// Check if the handler may retry the step that raised this error
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Stable, inspectable error classification reported in every failed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidEvent,
    ObjectNotFound,
    ObjectStoreUnavailable,
    ObjectTooLarge,
    CredentialNotFound,
    CredentialMalformed,
    CredentialStoreUnavailable,
    AuthenticationFailed,
    HostKeyRejected,
    ConnectionFailed,
    ConnectionTimeout,
    TransferInterruptedRetryable,
    TransferInterruptedRejected,
    DeadlineExceeded,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ObjectStoreUnavailable
                | ErrorKind::CredentialStoreUnavailable
                | ErrorKind::ConnectionFailed
                | ErrorKind::ConnectionTimeout
                | ErrorKind::TransferInterruptedRetryable
        )
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidEvent => ErrorCategory::Caller,
            ErrorKind::CredentialNotFound
            | ErrorKind::CredentialMalformed
            | ErrorKind::AuthenticationFailed
            | ErrorKind::HostKeyRejected => ErrorCategory::Configuration,
            ErrorKind::ObjectStoreUnavailable
            | ErrorKind::CredentialStoreUnavailable
            | ErrorKind::ConnectionFailed
            | ErrorKind::ConnectionTimeout
            | ErrorKind::TransferInterruptedRetryable => ErrorCategory::Transient,
            ErrorKind::ObjectNotFound
            | ErrorKind::ObjectTooLarge
            | ErrorKind::TransferInterruptedRejected => ErrorCategory::Rejected,
            ErrorKind::DeadlineExceeded => ErrorCategory::Deadline,
        }
    }
}

/// Who has to act on a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The event source sent something that is not a creation notification
    Caller,
    /// Wrong or missing credentials, host key, or secret layout. Needs an operator.
    Configuration,
    /// Infrastructure hiccup; redelivery is expected to succeed
    Transient,
    /// The object or the remote refused the transfer
    Rejected,
    /// The invocation ran out of time
    Deadline,
}
