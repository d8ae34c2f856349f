//! Facility sync engine state machine.

use crate::batch::{BatchTransferCoordinator, TransferReport};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use outpost_core::{
    collect_outgoing_changes, facts, flatten, save_changes_for_model, ExportWindow, HookRegistry,
    LiveStore, RelationPlanner, SaveStats, SnapshotSessionStore, StagingArea, StampPolicy,
};
use outpost_protocol::{
    ChangeRecord, Cursor, Direction, InitiatePullRequest, StartSessionRequest,
    StartSessionResponse, SyncTick,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is opening a session with central.
    Connecting,
    /// Engine is pushing local changes.
    Pushing,
    /// Engine is pulling central changes.
    Pulling,
    /// Engine has completed a sync cycle.
    Synced,
    /// Engine encountered an error.
    Error,
    /// Engine is waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Connecting | SyncState::Pushing | SyncState::Pulling
        )
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Statistics about sync sessions.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of changes pushed.
    pub records_pushed: u64,
    /// Total number of changes pulled.
    pub records_pulled: u64,
    /// Total number of retried pages and sessions.
    pub retries: u64,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Session ID of the last attempted session.
    pub last_session_id: Option<String>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Session the cycle ran in.
    pub session_id: String,
    /// Number of changes pushed.
    pub pushed: u64,
    /// Number of changes pulled, after unnesting.
    pub pulled: u64,
    /// Number of push pages sent.
    pub push_pages: usize,
    /// Number of pull pages received.
    pub pull_pages: usize,
    /// Staged records changed by incoming sync hooks.
    pub hook_rewrites: usize,
    /// What saving the pulled changes did.
    pub saved: SaveStats,
    /// Whether the sync was successful.
    pub success: bool,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

struct PullOutcome {
    report: TransferReport,
    pulled: usize,
    hook_rewrites: usize,
    saved: SaveStats,
}

/// Runs sync sessions for one facility: push local changes, then pull
/// central changes.
pub struct FacilitySyncEngine<T: SyncTransport> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<LiveStore>,
    planner: Arc<RelationPlanner>,
    hooks: HookRegistry,
    staging: SnapshotSessionStore,
    full_resync: RwLock<Vec<String>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: Arc<AtomicBool>,
}

impl<T: SyncTransport> FacilitySyncEngine<T> {
    /// Creates a new sync engine over `store`.
    pub fn new(
        config: SyncConfig,
        transport: T,
        store: Arc<LiveStore>,
        planner: Arc<RelationPlanner>,
    ) -> Self {
        transport.set_request_timeout(config.timeout);
        Self {
            config,
            transport: Arc::new(transport),
            store,
            planner,
            hooks: HookRegistry::empty(),
            staging: SnapshotSessionStore::new(),
            full_resync: RwLock::new(Vec::new()),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the hooks run on pulled changes before they are saved.
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// The transport this engine talks through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The facility's live store.
    pub fn store(&self) -> &Arc<LiveStore> {
        &self.store
    }

    /// The facility's staging areas.
    pub fn staging(&self) -> &SnapshotSessionStore {
        &self.staging
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Asks central to re-send these models in full on the next successful
    /// pull.
    pub fn request_full_resync<I, S>(&self, models: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending = self.full_resync.write();
        for model in models {
            let model = model.into();
            if !pending.contains(&model) {
                pending.push(model);
            }
        }
    }

    /// Models waiting to be re-sent in full.
    pub fn pending_full_resync(&self) -> Vec<String> {
        self.full_resync.read().clone()
    }

    /// Cancels any ongoing sync at the next batch boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn coordinator(&self) -> BatchTransferCoordinator {
        BatchTransferCoordinator::new(self.config.limiter.clone(), self.config.retry.clone())
            .with_cancel_flag(Arc::clone(&self.cancelled))
    }

    /// Performs a full sync cycle: push then pull.
    ///
    /// A failed session is reported to central and its staging area is
    /// dropped. Progress committed by earlier phases is kept.
    pub fn sync(&self) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        self.reset_cancel();

        if !self.state().can_start_sync() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", self.state()),
                to: "sync".into(),
            });
        }
        if let Err(e) = self.preflight() {
            self.handle_error(None, &e);
            return Err(e);
        }

        self.set_state(SyncState::Connecting);
        let session = match self.start_session() {
            Ok(session) => session,
            Err(e) => {
                self.handle_error(None, &e);
                return Err(e);
            }
        };
        self.stats.write().last_session_id = Some(session.session_id.clone());

        match self.run_session(&session, start) {
            Ok(result) => {
                self.set_state(SyncState::Synced);
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.records_pushed += result.pushed;
                stats.records_pulled += result.pulled;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                Ok(result)
            }
            Err(e) => {
                self.handle_error(Some(&session.session_id), &e);
                Err(e)
            }
        }
    }

    /// Performs a sync, starting a fresh session after transient errors.
    pub fn sync_with_retry(&self) -> SyncResult<SyncCycleResult> {
        let retry_config = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry_config.max_attempts {
            if attempt > 0 {
                self.set_state(SyncState::RetryWait);
                std::thread::sleep(retry_config.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
                // Back to a startable state for the next attempt.
                self.set_state(SyncState::Error);
            }

            self.check_cancelled()?;

            match self.sync() {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt + 1 < retry_config.max_attempts => {
                    warn!(attempt, error = %e, "sync session failed, starting a new one");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::InvalidConfig("retry.max_attempts is 0".into())))
    }

    fn preflight(&self) -> SyncResult<()> {
        self.config.validate()?;
        self.planner.validate_all()?;
        let dropped = self.staging.drop_all();
        if dropped > 0 {
            warn!(dropped, "dropped staging areas left by an earlier session");
        }
        Ok(())
    }

    fn start_session(&self) -> SyncResult<StartSessionResponse> {
        let last_pulled = self
            .store
            .tick_fact(facts::LAST_SUCCESSFUL_PULL)?
            .unwrap_or(SyncTick::ORIGIN);
        let mut request =
            StartSessionRequest::new(&self.config.facility_id, &self.config.device_id, last_pulled);
        request.debug_info.insert(
            "engine_version".into(),
            Value::String(env!("CARGO_PKG_VERSION").into()),
        );
        request.debug_info.insert(
            "initial_limit".into(),
            Value::from(self.config.limiter.initial_limit),
        );

        let session = self.transport.start_session(&request)?;
        info!(
            session_id = %session.session_id,
            started_at_tick = %session.started_at_tick,
            facility_id = %self.config.facility_id,
            "sync session started"
        );
        Ok(session)
    }

    fn run_session(
        &self,
        session: &StartSessionResponse,
        start: Instant,
    ) -> SyncResult<SyncCycleResult> {
        self.set_state(SyncState::Pushing);
        let push = self.push_changes(session)?;
        self.check_cancelled()?;

        self.set_state(SyncState::Pulling);
        let pull = self.pull_changes(&session.session_id)?;

        self.transport.end_session(&session.session_id)?;
        self.staging.close(&session.session_id)?;

        self.stats.write().retries += u64::from(push.retries + pull.report.retries);
        let result = SyncCycleResult {
            session_id: session.session_id.clone(),
            pushed: push.records as u64,
            pulled: pull.pulled as u64,
            push_pages: push.pages,
            pull_pages: pull.report.pages,
            hook_rewrites: pull.hook_rewrites,
            saved: pull.saved,
            success: true,
            duration: start.elapsed(),
        };
        info!(
            session_id = %result.session_id,
            pushed = result.pushed,
            pulled = result.pulled,
            written = result.saved.written(),
            duration_ms = result.duration.as_millis() as u64,
            "sync session completed"
        );
        Ok(result)
    }

    /// Pushes every local change made since the last successful push.
    ///
    /// The facility adopts the session's tick as its clock, waits for local
    /// writers still using an older tick, and exports everything up to that
    /// older tick. The push cursor only moves once central confirms the
    /// changes are persisted.
    fn push_changes(&self, session: &StartSessionResponse) -> SyncResult<TransferReport> {
        let session_id = session.session_id.as_str();
        let clock = self.store.clock();
        // Writes from now on carry a tick above the snapshot bound.
        let target = session.started_at_tick.max(clock.current_tick().next());
        let until = clock.set_current_tick(target);
        clock.wait_for_tick_timeout(until, self.config.tick_wait_timeout)?;

        let since = self
            .store
            .tick_fact(facts::LAST_SUCCESSFUL_PUSH)?
            .unwrap_or(SyncTick::ORIGIN);
        let area = self.staging.open(session_id)?;
        let models = self.planner.registry().for_push();
        let outgoing = collect_outgoing_changes(
            &self.store,
            &self.planner,
            &models,
            ExportWindow::between(since, until),
        )?;
        area.insert(outgoing)?;

        let pending = staged(&area, Direction::Outgoing)?;
        info!(session_id, %since, %until, count = pending.len(), "pushing outgoing changes");

        let report = self
            .coordinator()
            .push_all(&*self.transport, session_id, &pending)?;
        self.await_push_persisted(session_id)?;

        self.store.write(|tx| {
            tx.set_tick_fact(facts::LAST_SUCCESSFUL_PUSH, until);
            Ok(())
        })?;
        Ok(report)
    }

    fn await_push_persisted(&self, session_id: &str) -> SyncResult<()> {
        if self.transport.complete_push(session_id)? {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.push_complete_timeout;
        loop {
            self.check_cancelled()?;
            std::thread::sleep(self.config.push_poll_interval);
            if self.transport.check_push_complete(session_id)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Timeout);
            }
        }
    }

    fn pull_request(&self, session_id: &str, since: SyncTick) -> InitiatePullRequest {
        let mut request = InitiatePullRequest::new(session_id, since)
            .with_tables_for_full_resync(self.full_resync.read().iter().cloned());
        if let Some(models) = &self.config.pull_models {
            request = request.with_tables_to_include(models.iter().cloned());
        }
        request
    }

    /// Pulls everything central has for this facility, rewrites it with the
    /// incoming hooks and saves it.
    fn pull_changes(&self, session_id: &str) -> SyncResult<PullOutcome> {
        let since = self
            .store
            .tick_fact(facts::LAST_SUCCESSFUL_PULL)?
            .unwrap_or(SyncTick::ORIGIN);
        let request = self.pull_request(session_id, since);
        let metadata = self.transport.initiate_pull(&request)?;
        info!(
            session_id,
            %since,
            pull_until = %metadata.pull_until,
            total_to_pull = metadata.total_to_pull,
            "pulling central changes"
        );

        let area = self.staging.get(session_id)?;
        let (report, _) = self.coordinator().pull_all(
            &*self.transport,
            session_id,
            Cursor::default(),
            |page| {
                let mut unnested = Vec::with_capacity(page.len());
                for change in page {
                    let plan = self.planner.build_plan(&change.record_type)?;
                    unnested.extend(flatten(&plan, &change.with_direction(Direction::Incoming))?);
                }
                area.insert(unnested)?;
                Ok(())
            },
        )?;
        if report.records as u64 != metadata.total_to_pull {
            warn!(
                session_id,
                received = report.records,
                expected = metadata.total_to_pull,
                "pulled a different number of changes than announced"
            );
        }

        let hook_rewrites = self.hooks.run(&area)?;
        let incoming = staged(&area, Direction::Incoming)?;
        let saved = self.save_incoming(&incoming, metadata.pull_until)?;
        if !request.tables_for_full_resync.is_empty() {
            self.full_resync
                .write()
                .retain(|m| !request.tables_for_full_resync.contains(m));
        }

        Ok(PullOutcome {
            report,
            pulled: incoming.len(),
            hook_rewrites,
            saved,
        })
    }

    /// Saves pulled changes in transactions of at most `save_batch_size`
    /// records. The pull cursor is written with the last batch.
    ///
    /// The last batch also moves the clock past `pull_until`, so local edits
    /// made after this pull outrank every version central just sent.
    fn save_incoming(&self, incoming: &[ChangeRecord], pull_until: SyncTick) -> SyncResult<SaveStats> {
        let registry = self.planner.registry();
        let batches: Vec<&[ChangeRecord]> = if incoming.is_empty() {
            vec![&[]]
        } else {
            incoming.chunks(self.config.save_batch_size).collect()
        };
        let last = batches.len() - 1;

        let mut total = SaveStats::default();
        for (i, batch) in batches.into_iter().enumerate() {
            self.check_cancelled()?;
            let mut by_model: BTreeMap<&str, Vec<ChangeRecord>> = BTreeMap::new();
            for change in batch {
                by_model
                    .entry(change.record_type.as_str())
                    .or_default()
                    .push(change.clone());
            }

            let stats = self.store.write(|tx| {
                let mut stats = SaveStats::default();
                for (model, changes) in &by_model {
                    let schema = registry.get(model)?;
                    if !schema.direction.pulls() {
                        warn!(model, count = changes.len(), "skipping changes for a model facilities do not pull");
                        continue;
                    }
                    stats.absorb(save_changes_for_model(tx, schema, changes, StampPolicy::Facility)?);
                }
                if i == last {
                    tx.set_tick_fact(facts::LAST_SUCCESSFUL_PULL, pull_until);
                    self.store.clock().set_current_tick(pull_until.next());
                }
                Ok(stats)
            })?;
            total.absorb(stats);
        }
        Ok(total)
    }

    /// Updates state and stats after a failure and cleans up the session.
    fn handle_error(&self, session_id: Option<&str>, error: &SyncError) {
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());

        let Some(session_id) = session_id else {
            warn!(error = %error, "sync failed before a session was opened");
            return;
        };
        warn!(session_id, error = %error, "sync session failed");
        if let Err(e) = self.staging.close(session_id) {
            warn!(session_id, error = %e, "could not drop staging area");
        }
        if let Err(e) = self
            .transport
            .mark_session_errored(session_id, &error.to_string())
        {
            warn!(session_id, error = %e, "could not report session failure");
        }
    }
}

fn staged(area: &StagingArea, direction: Direction) -> SyncResult<Vec<ChangeRecord>> {
    Ok(area
        .find(direction, 0, usize::MAX)?
        .into_iter()
        .map(|s| s.change)
        .collect())
}
