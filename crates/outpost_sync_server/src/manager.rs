//! Central side of sync sessions.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use outpost_core::{
    collect_outgoing_changes, flatten, save_changes_for_model, ExportWindow, LiveStore,
    ModelSchema, RelationPlanner, SaveStats, SessionLog, SnapshotSessionStore, StagedChange,
    StampPolicy, SyncSession,
};
use outpost_protocol::{
    ChangeRecord, Cursor, Direction, InitiatePullRequest, PullMetadata, PullPage, RecordData,
    StartSessionRequest, StartSessionResponse, SyncTick,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Runs the central half of every facility's sync sessions.
///
/// Central owns the authoritative clock. Each session reserves a unique tick
/// when it starts; pushed changes are persisted stamped with a fresh tock;
/// the pull snapshot covers everything up to a tick no in-flight writer is
/// still using.
pub struct CentralSyncManager {
    config: ServerConfig,
    store: Arc<LiveStore>,
    planner: Arc<RelationPlanner>,
    sessions: SessionLog,
    staging: SnapshotSessionStore,
}

impl CentralSyncManager {
    /// Creates a manager over central's live store.
    pub fn new(config: ServerConfig, store: Arc<LiveStore>, planner: Arc<RelationPlanner>) -> Self {
        Self {
            config,
            store,
            planner,
            sessions: SessionLog::new(),
            staging: SnapshotSessionStore::new(),
        }
    }

    /// Central's live store.
    pub fn store(&self) -> &Arc<LiveStore> {
        &self.store
    }

    /// The session audit log.
    pub fn sessions(&self) -> &SessionLog {
        &self.sessions
    }

    /// Central's staging areas.
    pub fn staging(&self) -> &SnapshotSessionStore {
        &self.staging
    }

    /// Opens a session for a facility and reserves its tick.
    pub fn start_session(&self, request: &StartSessionRequest) -> ServerResult<StartSessionResponse> {
        self.expire_stale_sessions();
        let open = self.sessions.open_sessions();
        if open >= self.config.max_concurrent_sessions {
            warn!(open, facility_id = %request.facility_id, "refusing sync session, at capacity");
            return Err(ServerError::TooManySessions {
                max: self.config.max_concurrent_sessions,
            });
        }

        let tick = self.store.clock().tick_tock().tick;
        let mut debug_info = request.debug_info.clone();
        debug_info.insert(
            "last_synced_tick".into(),
            Value::from(request.last_synced_tick.as_i64()),
        );
        let session = self.sessions.create(tick, debug_info);

        let mut parameters = RecordData::new();
        parameters.insert("facility_id".into(), Value::String(request.facility_id.clone()));
        parameters.insert("device_id".into(), Value::String(request.device_id.clone()));
        self.sessions.set_parameters(&session.id, parameters)?;
        self.staging.open(&session.id)?;

        info!(
            session_id = %session.id,
            facility_id = %request.facility_id,
            device_id = %request.device_id,
            started_at_tick = %tick,
            "sync session started"
        );
        Ok(StartSessionResponse {
            session_id: session.id,
            started_at_tick: tick,
        })
    }

    /// Looks up a session that may still be used and records the contact.
    ///
    /// Unknown, errored, completed and timed-out sessions are refused.
    pub fn connect_to_session(&self, session_id: &str) -> ServerResult<SyncSession> {
        let session = self.sessions.get(session_id)?;
        let unavailable = |reason: String| ServerError::SessionUnavailable {
            session_id: session_id.to_string(),
            reason,
        };
        if let Some(error) = &session.error {
            return Err(unavailable(format!("errored: {error}")));
        }
        if session.completed_at.is_some() {
            return Err(unavailable("already completed".into()));
        }
        if self.is_timed_out(&session) {
            self.abandon(session_id, "session timed out");
            return Err(unavailable("timed out".into()));
        }
        Ok(self.sessions.touch(session_id)?)
    }

    /// Stages one page of pushed changes.
    pub fn add_incoming_changes(
        &self,
        session_id: &str,
        changes: Vec<ChangeRecord>,
    ) -> ServerResult<usize> {
        let session = self.connect_to_session(session_id)?;
        if session.persist_completed_at.is_some() {
            return Err(ServerError::InvalidRequest(
                "push already completed for this session".into(),
            ));
        }
        if changes.len() > self.config.max_push_page as usize {
            return Err(ServerError::InvalidRequest(format!(
                "push page of {} exceeds {}",
                changes.len(),
                self.config.max_push_page
            )));
        }

        let registry = self.planner.registry();
        for change in &changes {
            let schema = registry.get(&change.record_type)?;
            if !schema.direction.pushes() {
                return Err(ServerError::InvalidRequest(format!(
                    "{} is not pushed by facilities",
                    change.record_type
                )));
            }
        }

        let area = self.staging.get(session_id)?;
        let staged = area.insert(
            changes
                .into_iter()
                .map(|c| c.with_direction(Direction::Incoming)),
        )?;
        debug!(session_id, staged, "staged pushed changes");
        Ok(staged)
    }

    /// Persists everything the facility pushed.
    ///
    /// Runs once per session; later calls report completion without doing
    /// anything.
    pub fn complete_push(&self, session_id: &str) -> ServerResult<bool> {
        let session = self.connect_to_session(session_id)?;
        if session.persist_completed_at.is_some() {
            return Ok(true);
        }

        let area = self.staging.get(session_id)?;
        let staged = area.find(Direction::Incoming, 0, usize::MAX)?;
        let mut by_model: BTreeMap<String, Vec<ChangeRecord>> = BTreeMap::new();
        for s in &staged {
            let plan = self.planner.build_plan(&s.change.record_type)?;
            for change in flatten(&plan, &s.change)? {
                by_model
                    .entry(change.record_type.clone())
                    .or_default()
                    .push(change);
            }
        }

        let registry = self.planner.registry();
        let (tock, stats) = self.store.write(|tx| {
            let tock = tx.tick_tock().tock;
            let mut stats = SaveStats::default();
            for (model, changes) in &by_model {
                let schema = registry.get(model)?;
                stats.absorb(save_changes_for_model(
                    tx,
                    schema,
                    changes,
                    StampPolicy::Central { tock },
                )?);
            }
            Ok((tock, stats))
        })?;

        area.update(staged.into_iter().map(|s| StagedChange {
            id: s.id,
            change: ChangeRecord {
                saved_at_sync_tick: Some(tock),
                ..s.change
            },
        }))?;
        // Later central writes must not share the tock.
        self.store.clock().tick_tock();
        self.sessions
            .update(session_id, |s| s.persist_completed_at = Some(SystemTime::now()))?;

        info!(
            session_id,
            %tock,
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            restored = stats.restored,
            unchanged = stats.unchanged,
            "persisted pushed changes"
        );
        Ok(true)
    }

    /// Whether the session's push has been persisted.
    pub fn check_push_complete(&self, session_id: &str) -> ServerResult<bool> {
        let session = self.connect_to_session(session_id)?;
        Ok(session.persist_completed_at.is_some())
    }

    /// Snapshots the changes the facility should pull.
    ///
    /// Changes the session just pushed are left out of the snapshot. Models
    /// named in `tables_for_full_resync` are snapshotted from the beginning
    /// of time. Calling it again returns the existing snapshot.
    pub fn initiate_pull(&self, request: &InitiatePullRequest) -> ServerResult<PullMetadata> {
        let session_id = request.session_id.as_str();
        let since = request.since;
        let session = self.connect_to_session(session_id)?;
        if session.snapshot_completed_at.is_some() {
            return self.fetch_pull_metadata(session_id);
        }
        let (models, full_resync) = self.pull_models(request)?;

        let clock = self.store.clock();
        let until = clock.tick_tock().tick;
        clock.wait_for_tick_timeout(until, self.config.tick_wait_timeout)?;

        let area = self.staging.get(session_id)?;
        let mut outgoing = collect_outgoing_changes(
            &self.store,
            &self.planner,
            &models,
            ExportWindow::between(since, until),
        )?;
        if !full_resync.is_empty() {
            outgoing.extend(collect_outgoing_changes(
                &self.store,
                &self.planner,
                &full_resync,
                ExportWindow::between(SyncTick::ORIGIN, until),
            )?);
        }
        let snapshotted = area.insert(outgoing)?;
        let echoes = area.remove_echoed_changes()?;
        let total = area.sort_outgoing()?;

        self.sessions.update(session_id, |s| {
            s.pull_since = Some(since);
            s.pull_until = Some(until);
            s.snapshot_completed_at = Some(SystemTime::now());
            if !request.tables_for_full_resync.is_empty() {
                s.parameters.insert(
                    "tables_for_full_resync".into(),
                    Value::from(request.tables_for_full_resync.clone()),
                );
            }
        })?;
        info!(
            session_id,
            %since,
            %until,
            snapshotted,
            echoes,
            total,
            full_resync = full_resync.len(),
            "snapshot ready for pull"
        );
        Ok(PullMetadata {
            total_to_pull: total as u64,
            pull_until: until,
        })
    }

    /// Size and bound of a prepared snapshot.
    pub fn fetch_pull_metadata(&self, session_id: &str) -> ServerResult<PullMetadata> {
        let session = self.connect_to_session(session_id)?;
        let pull_until = match (session.snapshot_completed_at, session.pull_until) {
            (Some(_), Some(until)) => until,
            _ => {
                return Err(ServerError::InvalidRequest(
                    "pull has not been initiated".into(),
                ))
            }
        };
        let total = self.staging.get(session_id)?.count(Direction::Outgoing)?;
        Ok(PullMetadata {
            total_to_pull: total as u64,
            pull_until,
        })
    }

    /// One page of the snapshot after `since`.
    pub fn pull(&self, session_id: &str, since: &Cursor, limit: u32) -> ServerResult<PullPage> {
        let session = self.connect_to_session(session_id)?;
        if session.snapshot_completed_at.is_none() {
            return Err(ServerError::InvalidRequest(
                "pull has not been initiated".into(),
            ));
        }
        if limit == 0 || limit > self.config.max_pull_page {
            return Err(ServerError::InvalidRequest(format!(
                "pull limit {limit} outside 1..={}",
                self.config.max_pull_page
            )));
        }

        let area = self.staging.get(session_id)?;
        let records = area.outgoing_after(since, limit as usize)?;
        debug!(session_id, count = records.len(), limit, "serving pull page");
        Ok(PullPage::new(records, since))
    }

    /// Completes the session and drops its staging area.
    pub fn end_session(&self, session_id: &str) -> ServerResult<()> {
        let session = self.connect_to_session(session_id)?;
        self.sessions.complete(session_id)?;
        self.staging.close(session_id)?;
        let elapsed = SystemTime::now()
            .duration_since(session.started_at)
            .unwrap_or_default();
        info!(
            session_id,
            duration_ms = elapsed.as_millis() as u64,
            "sync session completed"
        );
        Ok(())
    }

    /// Records a failure reported by the facility and drops the staging
    /// area.
    pub fn mark_session_errored(&self, session_id: &str, error: &str) -> ServerResult<()> {
        self.sessions.mark_errored(session_id, error)?;
        self.staging.close(session_id)?;
        warn!(session_id, error, "sync session errored");
        Ok(())
    }

    /// Marks open sessions idle for longer than the timeout as errored.
    ///
    /// Returns how many sessions were abandoned.
    pub fn expire_stale_sessions(&self) -> usize {
        let stale: Vec<String> = self
            .sessions
            .open()
            .into_iter()
            .filter(|s| self.is_timed_out(s))
            .map(|s| s.id)
            .collect();
        for session_id in &stale {
            self.abandon(session_id, "session timed out");
        }
        stale.len()
    }

    /// Splits the pulled models into those snapshotted since the facility's
    /// last pull and those re-sent in full.
    fn pull_models(
        &self,
        request: &InitiatePullRequest,
    ) -> ServerResult<(Vec<Arc<ModelSchema>>, Vec<Arc<ModelSchema>>)> {
        let registry = self.planner.registry();
        let named = request
            .tables_to_include
            .iter()
            .flatten()
            .chain(&request.tables_for_full_resync);
        for name in named {
            registry.get(name)?;
        }

        let resync = &request.tables_for_full_resync;
        let (full_resync, incremental): (Vec<_>, Vec<_>) = registry
            .for_pull()
            .into_iter()
            .partition(|m| resync.contains(&m.name));
        let incremental = incremental
            .into_iter()
            .filter(|m| {
                request
                    .tables_to_include
                    .as_ref()
                    .map_or(true, |tables| tables.contains(&m.name))
            })
            .collect();
        Ok((incremental, full_resync))
    }

    fn is_timed_out(&self, session: &SyncSession) -> bool {
        SystemTime::now()
            .duration_since(session.last_connection_time)
            .unwrap_or(Duration::ZERO)
            > self.config.session_timeout
    }

    fn abandon(&self, session_id: &str, reason: &str) {
        if let Err(e) = self.mark_session_errored(session_id, reason) {
            warn!(session_id, error = %e, "could not abandon sync session");
        }
    }
}

impl std::fmt::Debug for CentralSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralSyncManager")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("staging_areas", &self.staging.len())
            .finish()
    }
}
