//! Error types for the sync server.

use outpost_core::CoreError;
use outpost_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No session with this ID exists.
    #[error("sync session {0} not found")]
    SessionNotFound(String),

    /// The session exists but can no longer be used.
    #[error("sync session {session_id} is unavailable: {reason}")]
    SessionUnavailable {
        /// Session ID.
        session_id: String,
        /// Why the session cannot be used.
        reason: String,
    },

    /// Too many sessions are open.
    #[error("too many open sync sessions (limit {max})")]
    TooManySessions {
        /// Configured limit.
        max: usize,
    },

    /// Message could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Store or engine failure.
    #[error("core error: {0}")]
    Core(CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for ServerError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::SessionNotFound { session_id } => ServerError::SessionNotFound(session_id),
            other => ServerError::Core(other),
        }
    }
}

impl ServerError {
    /// Returns true if the facility sent something wrong.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::SessionNotFound(_)
                | ServerError::SessionUnavailable { .. }
                | ServerError::Protocol(_)
        ) || matches!(self, ServerError::Core(e) if e.is_configuration())
    }

    /// Returns true if central failed.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error() && !matches!(self, ServerError::TooManySessions { .. })
    }

    /// Returns true if sending the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::TooManySessions { .. } | ServerError::Internal(_) => true,
            ServerError::Core(CoreError::TickWaitTimeout { .. }) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_protocol::SyncTick;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::TooManySessions { max: 2 }.is_retryable());
        assert!(ServerError::from(CoreError::TickWaitTimeout {
            tick: SyncTick::new(3)
        })
        .is_retryable());
    }

    #[test]
    fn missing_session_maps_to_not_found() {
        let err = ServerError::from(CoreError::SessionNotFound {
            session_id: "abc".into(),
        });
        assert!(matches!(err, ServerError::SessionNotFound(ref id) if id == "abc"));
        assert!(err.to_string().contains("abc"));
    }
}
