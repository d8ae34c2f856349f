//! Error types for Outpost core.

use outpost_protocol::SyncTick;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Outpost core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Protocol codec error.
    #[error("protocol error: {0}")]
    Protocol(#[from] outpost_protocol::ProtocolError),

    /// Session ID cannot be used to name a staging area.
    #[error("unsafe session id {session_id:?}: only [A-Za-z0-9-] is allowed")]
    UnsafeSessionId {
        /// The rejected ID.
        session_id: String,
    },

    /// Model is not registered.
    #[error("unknown model: {model}")]
    UnknownModel {
        /// Model name.
        model: String,
    },

    /// A declared sync relation does not resolve to a relation of the model.
    #[error("model {model} declares sync relation {relation} which does not exist")]
    UnresolvedRelation {
        /// Model declaring the relation.
        model: String,
        /// Relation name that failed to resolve.
        relation: String,
    },

    /// Staging area was closed and must not be used any more.
    #[error("staging area for session {session_id} is closed")]
    StagingAreaClosed {
        /// Session ID.
        session_id: String,
    },

    /// Staging area was never opened.
    #[error("no staging area for session {session_id}")]
    StagingAreaMissing {
        /// Session ID.
        session_id: String,
    },

    /// Sync session row not found.
    #[error("sync session {session_id} not found")]
    SessionNotFound {
        /// Session ID.
        session_id: String,
    },

    /// Waiting for in-flight writers timed out.
    #[error("timed out waiting for writers at or below {tick}")]
    TickWaitTimeout {
        /// Tick being waited for.
        tick: SyncTick,
    },

    /// A snapshot hook failed.
    #[error("sync hook for {model} failed: {message}")]
    HookFailed {
        /// Model the hook is registered for.
        model: String,
        /// Failure description.
        message: String,
    },

    /// A record cannot be stored as given.
    #[error("invalid record {record}: {message}")]
    InvalidRecord {
        /// Record key.
        record: String,
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid record error.
    pub fn invalid_record(record: impl ToString, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            record: record.to_string(),
            message: message.into(),
        }
    }

    /// Returns true for configuration errors, which are fatal and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::UnsafeSessionId { .. }
                | CoreError::UnknownModel { .. }
                | CoreError::UnresolvedRelation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors() {
        assert!(CoreError::UnresolvedRelation {
            model: "patients".into(),
            relation: "nope".into(),
        }
        .is_configuration());
        assert!(CoreError::UnsafeSessionId {
            session_id: "a;b".into()
        }
        .is_configuration());
        assert!(!CoreError::TickWaitTimeout {
            tick: SyncTick::new(3)
        }
        .is_configuration());
    }

    #[test]
    fn error_display() {
        let err = CoreError::UnresolvedRelation {
            model: "patients".into(),
            relation: "encounterz".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("patients"));
        assert!(msg.contains("encounterz"));
    }
}
