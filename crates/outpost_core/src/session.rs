//! The sync session audit log.
//!
//! Session rows outlive their staging areas and are never deleted.

use crate::error::{CoreError, CoreResult};
use outpost_protocol::{RecordData, SyncTick};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;
use uuid::Uuid;

/// One sync session between a facility and central.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    /// Session ID, always a safe staging identifier.
    pub id: String,
    /// When the session was created.
    pub started_at: SystemTime,
    /// Last time the facility talked to the session.
    pub last_connection_time: SystemTime,
    /// When the session finished successfully.
    pub completed_at: Option<SystemTime>,
    /// Why the session failed.
    pub error: Option<String>,
    /// Tick reserved for this session when it started.
    pub started_at_tick: SyncTick,
    /// Lower bound of the pull snapshot.
    pub pull_since: Option<SyncTick>,
    /// Upper bound of the pull snapshot.
    pub pull_until: Option<SyncTick>,
    /// When pushed changes finished persisting.
    pub persist_completed_at: Option<SystemTime>,
    /// When the outgoing snapshot finished.
    pub snapshot_completed_at: Option<SystemTime>,
    /// Free-form diagnostics.
    pub debug_info: RecordData,
    /// Parameters the session was run with.
    pub parameters: RecordData,
}

impl SyncSession {
    /// Returns true if the session ended, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some() || self.error.is_some()
    }
}

/// Stores [`SyncSession`] rows.
#[derive(Debug, Default)]
pub struct SessionLog {
    sessions: RwLock<HashMap<String, SyncSession>>,
}

impl SessionLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new session row with a fresh UUID.
    pub fn create(&self, started_at_tick: SyncTick, debug_info: RecordData) -> SyncSession {
        let now = SystemTime::now();
        let session = SyncSession {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            last_connection_time: now,
            completed_at: None,
            error: None,
            started_at_tick,
            pull_since: None,
            pull_until: None,
            persist_completed_at: None,
            snapshot_completed_at: None,
            debug_info,
            parameters: RecordData::new(),
        };
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Reads a session row.
    pub fn get(&self, session_id: &str) -> CoreResult<SyncSession> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| not_found(session_id))
    }

    /// Applies `f` to a session row and returns the updated row.
    pub fn update(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SyncSession),
    ) -> CoreResult<SyncSession> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        f(session);
        Ok(session.clone())
    }

    /// Records that the facility is still talking to the session.
    pub fn touch(&self, session_id: &str) -> CoreResult<SyncSession> {
        self.update(session_id, |s| s.last_connection_time = SystemTime::now())
    }

    /// Marks the session as successfully completed.
    pub fn complete(&self, session_id: &str) -> CoreResult<SyncSession> {
        self.update(session_id, |s| s.completed_at = Some(SystemTime::now()))
    }

    /// Records why the session failed.
    pub fn mark_errored(&self, session_id: &str, error: impl Into<String>) -> CoreResult<SyncSession> {
        let error = error.into();
        self.update(session_id, |s| s.error = Some(error))
    }

    /// Merges diagnostics into the session's debug info.
    pub fn add_debug_info(&self, session_id: &str, info: RecordData) -> CoreResult<SyncSession> {
        self.update(session_id, |s| s.debug_info.extend(info))
    }

    /// Replaces the session's recorded parameters.
    pub fn set_parameters(&self, session_id: &str, parameters: RecordData) -> CoreResult<SyncSession> {
        self.update(session_id, |s| s.parameters = parameters)
    }

    /// Number of sessions that have not finished.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_finished())
            .count()
    }

    /// Sessions that have not finished.
    pub fn open(&self) -> Vec<SyncSession> {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_finished())
            .cloned()
            .collect()
    }

    /// Number of session rows.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true if no session was ever created.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

fn not_found(session_id: &str) -> CoreError {
    CoreError::SessionNotFound {
        session_id: session_id.to_string(),
    }
}
