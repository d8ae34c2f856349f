//! Transport layer abstraction for sync sessions.

use crate::error::{SyncError, SyncResult};
use outpost_protocol::{
    ChangeRecord, InitiatePullRequest, PullMetadata, PullPage, PullRequest, PushAck, PushRequest,
    StartSessionRequest, StartSessionResponse, SyncTick,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A sync transport carries session requests from a facility to central.
///
/// Implementations own their timeouts; a request that takes too long fails
/// with [`SyncError::Timeout`]. Transport errors are retried by the caller,
/// never inside the transport.
pub trait SyncTransport: Send + Sync {
    /// Sets how long a single request may take before it fails with
    /// [`SyncError::Timeout`].
    fn set_request_timeout(&self, timeout: Duration);

    /// Opens a session.
    fn start_session(&self, request: &StartSessionRequest) -> SyncResult<StartSessionResponse>;

    /// Sends one page of outgoing changes.
    fn push(&self, request: &PushRequest) -> SyncResult<PushAck>;

    /// Tells central every page was sent. Returns true once central has
    /// persisted them.
    fn complete_push(&self, session_id: &str) -> SyncResult<bool>;

    /// Asks whether central has finished persisting the push.
    fn check_push_complete(&self, session_id: &str) -> SyncResult<bool>;

    /// Asks central to snapshot the changes this facility should pull.
    fn initiate_pull(&self, request: &InitiatePullRequest) -> SyncResult<PullMetadata>;

    /// Fetches one page of changes.
    fn pull(&self, request: &PullRequest) -> SyncResult<PullPage>;

    /// Closes the session successfully.
    fn end_session(&self, session_id: &str) -> SyncResult<()>;

    /// Reports a local failure for the session.
    fn mark_session_errored(&self, session_id: &str, error: &str) -> SyncResult<()>;
}

/// A scripted transport for testing.
///
/// Pushed pages are recorded; pulls are served from a fixed list of
/// changes.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    session: Mutex<StartSessionResponse>,
    pushed: Mutex<Vec<Vec<ChangeRecord>>>,
    pull_source: Mutex<Vec<ChangeRecord>>,
    pull_limits: Mutex<Vec<u32>>,
    pull_until: Mutex<SyncTick>,
    failures_left: AtomicUsize,
    delay_per_record: Mutex<Duration>,
    stall: Mutex<Duration>,
    timeout: Mutex<Duration>,
    ended: Mutex<Vec<String>>,
    errored: Mutex<Vec<(String, String)>>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            session: Mutex::new(StartSessionResponse {
                session_id: "mock-session".into(),
                started_at_tick: SyncTick::new(1),
            }),
            pushed: Mutex::new(Vec::new()),
            pull_source: Mutex::new(Vec::new()),
            pull_limits: Mutex::new(Vec::new()),
            pull_until: Mutex::new(SyncTick::new(1)),
            failures_left: AtomicUsize::new(0),
            delay_per_record: Mutex::new(Duration::ZERO),
            stall: Mutex::new(Duration::ZERO),
            timeout: Mutex::new(Duration::from_secs(30)),
            ended: Mutex::new(Vec::new()),
            errored: Mutex::new(Vec::new()),
        }
    }

    /// Sets the session returned by `start_session`.
    pub fn set_session(&self, session_id: impl Into<String>, started_at_tick: SyncTick) {
        *self.session.lock() = StartSessionResponse {
            session_id: session_id.into(),
            started_at_tick,
        };
    }

    /// Sets the changes served by `pull`, and the tick they are complete up to.
    pub fn set_pull_source(&self, mut changes: Vec<ChangeRecord>, pull_until: SyncTick) {
        changes.sort_by(|a, b| {
            a.sync_tick
                .cmp(&b.sync_tick)
                .then_with(|| a.key().cmp(&b.key()))
        });
        *self.pull_source.lock() = changes;
        *self.pull_until.lock() = pull_until;
    }

    /// Makes the next `n` push or pull calls fail with a retryable error.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Makes every page take this long per record.
    pub fn set_delay_per_record(&self, delay: Duration) {
        *self.delay_per_record.lock() = delay;
    }

    /// Makes every push and pull page wait this long before central answers.
    pub fn set_stall(&self, stall: Duration) {
        *self.stall.lock() = stall;
    }

    /// The request timeout last set by the engine.
    pub fn request_timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Pages received by `push`, in order.
    pub fn pushed_pages(&self) -> Vec<Vec<ChangeRecord>> {
        self.pushed.lock().clone()
    }

    /// Limits requested by `pull`, in order.
    pub fn pull_limits(&self) -> Vec<u32> {
        self.pull_limits.lock().clone()
    }

    /// Sessions closed with `end_session`.
    pub fn ended_sessions(&self) -> Vec<String> {
        self.ended.lock().clone()
    }

    /// Sessions reported with `mark_session_errored`.
    pub fn errored_sessions(&self) -> Vec<(String, String)> {
        self.errored.lock().clone()
    }

    fn check(&self) -> SyncResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("not connected"));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::transport_retryable("connection dropped"));
        }
        self.await_reply()
    }

    fn await_reply(&self) -> SyncResult<()> {
        let stall = *self.stall.lock();
        let timeout = *self.timeout.lock();
        if stall > timeout {
            std::thread::sleep(timeout);
            return Err(SyncError::Timeout);
        }
        std::thread::sleep(stall);
        Ok(())
    }

    fn simulate_transfer(&self, records: usize) {
        let per_record = *self.delay_per_record.lock();
        if !per_record.is_zero() {
            let records = u32::try_from(records).unwrap_or(u32::MAX);
            std::thread::sleep(per_record.saturating_mul(records));
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn set_request_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    fn start_session(&self, _request: &StartSessionRequest) -> SyncResult<StartSessionResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("not connected"));
        }
        Ok(self.session.lock().clone())
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushAck> {
        self.check()?;
        self.simulate_transfer(request.changes.len());
        self.pushed.lock().push(request.changes.clone());
        Ok(PushAck::new(request.changes.len()))
    }

    fn complete_push(&self, _session_id: &str) -> SyncResult<bool> {
        Ok(true)
    }

    fn check_push_complete(&self, _session_id: &str) -> SyncResult<bool> {
        Ok(true)
    }

    fn initiate_pull(&self, _request: &InitiatePullRequest) -> SyncResult<PullMetadata> {
        Ok(PullMetadata {
            total_to_pull: self.pull_source.lock().len() as u64,
            pull_until: *self.pull_until.lock(),
        })
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullPage> {
        self.check()?;
        self.pull_limits.lock().push(request.limit);
        let records: Vec<ChangeRecord> = self
            .pull_source
            .lock()
            .iter()
            .filter(|c| request.since.is_before(c.sync_tick, &c.key()))
            .take(request.limit as usize)
            .cloned()
            .collect();
        self.simulate_transfer(records.len());
        Ok(PullPage::new(records, &request.since))
    }

    fn end_session(&self, session_id: &str) -> SyncResult<()> {
        self.ended.lock().push(session_id.to_string());
        Ok(())
    }

    fn mark_session_errored(&self, session_id: &str, error: &str) -> SyncResult<()> {
        self.errored
            .lock()
            .push((session_id.to_string(), error.to_string()));
        Ok(())
    }
}
