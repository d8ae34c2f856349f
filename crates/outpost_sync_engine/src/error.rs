//! Error types for the sync engine.

use outpost_core::CoreError;
use outpost_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (unexpected or undecodable message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Central rejected the request.
    #[error("server error: {message}")]
    Server {
        /// Error message from central.
        message: String,
        /// Whether central said the request may be retried.
        retryable: bool,
    },

    /// Local store or engine failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Server { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true for errors that will not go away by themselves.
    pub fn is_configuration(&self) -> bool {
        match self {
            SyncError::InvalidConfig(_) => true,
            SyncError::Core(e) => e.is_configuration(),
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Server {
            message: "busy".into(),
            retryable: true
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn configuration_errors() {
        let unsafe_id = SyncError::from(CoreError::UnsafeSessionId {
            session_id: "x;y".into(),
        });
        assert!(unsafe_id.is_configuration());
        assert!(!unsafe_id.is_retryable());
        assert!(!SyncError::Timeout.is_configuration());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::Timeout.to_string(), "operation timed out");
        let err = SyncError::InvalidStateTransition {
            from: "Pushing".into(),
            to: "sync".into(),
        };
        assert!(err.to_string().contains("Pushing"));
    }
}
