//! Per-session staging areas for in-flight change records.
//!
//! A staging area holds the outgoing and incoming change sets of exactly one
//! session, separate from the live store. Areas are opened and closed
//! explicitly; a closed area rejects every further operation.

use crate::error::{CoreError, CoreResult};
use crate::hooks::RewriteInstruction;
use outpost_protocol::{ChangeRecord, Cursor, Direction, RecordKey, SyncTick};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Checks that a session ID only uses `[A-Za-z0-9-]`.
pub fn validate_session_id(session_id: &str) -> CoreResult<()> {
    let safe = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if safe {
        Ok(())
    } else {
        Err(CoreError::UnsafeSessionId {
            session_id: session_id.to_string(),
        })
    }
}

/// A change record with its position in the staging area.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedChange {
    /// Insertion order within the area, starting at 1.
    pub id: u64,
    /// The staged change.
    pub change: ChangeRecord,
}

#[derive(Debug, Default)]
struct AreaInner {
    closed: bool,
    next_id: u64,
    // Ascending by `id`.
    records: Vec<StagedChange>,
    // Outgoing records in `(sync_tick, key)` order, dropped on any change.
    outgoing_order: Option<Vec<ChangeRecord>>,
}

impl AreaInner {
    fn position(&self, id: u64) -> Option<usize> {
        self.records.binary_search_by_key(&id, |s| s.id).ok()
    }
}

/// The staged change sets of one session.
#[derive(Debug)]
pub struct StagingArea {
    session_id: String,
    inner: RwLock<AreaInner>,
}

impl StagingArea {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            inner: RwLock::new(AreaInner::default()),
        }
    }

    /// The owning session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns true once the area has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    fn closed_error(&self) -> CoreError {
        CoreError::StagingAreaClosed {
            session_id: self.session_id.clone(),
        }
    }

    /// Appends change records. Returns how many were staged.
    pub fn insert(&self, changes: impl IntoIterator<Item = ChangeRecord>) -> CoreResult<usize> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(self.closed_error());
        }
        inner.outgoing_order = None;
        let before = inner.records.len();
        for change in changes {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.records.push(StagedChange { id, change });
        }
        Ok(inner.records.len() - before)
    }

    /// Replaces staged records by ID. Unknown IDs are ignored.
    ///
    /// Returns how many records were replaced.
    pub fn update(&self, updates: impl IntoIterator<Item = StagedChange>) -> CoreResult<usize> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(self.closed_error());
        }
        inner.outgoing_order = None;
        let mut updated = 0;
        for update in updates {
            if let Some(index) = inner.position(update.id) {
                inner.records[index].change = update.change;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Up to `limit` records of `direction` with an ID above `after_id`, in
    /// insertion order.
    pub fn find(
        &self,
        direction: Direction,
        after_id: u64,
        limit: usize,
    ) -> CoreResult<Vec<StagedChange>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(self.closed_error());
        }
        Ok(inner
            .records
            .iter()
            .filter(|s| s.change.direction == direction && s.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Number of staged records of `direction`.
    pub fn count(&self, direction: Direction) -> CoreResult<usize> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(self.closed_error());
        }
        Ok(inner
            .records
            .iter()
            .filter(|s| s.change.direction == direction)
            .count())
    }

    /// All staged records of `direction` for one model, in insertion order.
    pub fn records_for(
        &self,
        direction: Direction,
        record_type: &str,
    ) -> CoreResult<Vec<StagedChange>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(self.closed_error());
        }
        Ok(inner
            .records
            .iter()
            .filter(|s| s.change.direction == direction && s.change.record_type == record_type)
            .cloned()
            .collect())
    }

    /// Models with at least one staged record of `direction`.
    pub fn record_types(&self, direction: Direction) -> CoreResult<BTreeSet<String>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(self.closed_error());
        }
        Ok(inner
            .records
            .iter()
            .filter(|s| s.change.direction == direction)
            .map(|s| s.change.record_type.clone())
            .collect())
    }

    /// Fixes the `(sync_tick, record key)` order of the outgoing records so
    /// later calls to [`StagingArea::outgoing_after`] can seek instead of
    /// sorting. Any change to the area drops the order again.
    ///
    /// Returns how many outgoing records are ordered.
    pub fn sort_outgoing(&self) -> CoreResult<usize> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(self.closed_error());
        }
        let ordered = ordered_outgoing(&inner.records);
        let count = ordered.len();
        inner.outgoing_order = Some(ordered);
        Ok(count)
    }

    /// Up to `limit` outgoing records beyond `cursor`, in
    /// `(sync_tick, record key)` order.
    pub fn outgoing_after(&self, cursor: &Cursor, limit: usize) -> CoreResult<Vec<ChangeRecord>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(self.closed_error());
        }
        let page = match &inner.outgoing_order {
            Some(ordered) => {
                let start = ordered.partition_point(|c| !cursor.is_before(c.sync_tick, &c.key()));
                ordered[start..].iter().take(limit).cloned().collect()
            }
            None => ordered_outgoing(&inner.records)
                .into_iter()
                .filter(|c| cursor.is_before(c.sync_tick, &c.key()))
                .take(limit)
                .collect(),
        };
        Ok(page)
    }

    /// Applies a hook's rewrite to the incoming records of the area.
    ///
    /// Upserts replace the staged incoming record with the same key, or are
    /// appended if none exists. Deletes mark the staged incoming record as
    /// deleted. Returns how many records changed.
    pub fn apply_rewrite(&self, instruction: RewriteInstruction) -> CoreResult<usize> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(self.closed_error());
        }
        inner.outgoing_order = None;
        let mut changed = 0;

        for mut upsert in instruction.upserts {
            upsert.direction = Direction::Incoming;
            let key = upsert.key();
            match inner
                .records
                .iter()
                .position(|s| s.change.direction == Direction::Incoming && s.change.has_key(&key))
            {
                Some(index) => inner.records[index].change = upsert,
                None => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    inner.records.push(StagedChange { id, change: upsert });
                }
            }
            changed += 1;
        }

        for key in instruction.deletes {
            match inner
                .records
                .iter_mut()
                .find(|s| s.change.direction == Direction::Incoming && s.change.has_key(&key))
            {
                Some(staged) => {
                    if !staged.change.is_deleted {
                        staged.change.is_deleted = true;
                        changed += 1;
                    }
                }
                None => debug!(session_id = %self.session_id, record = %key, "rewrite deletes unstaged record"),
            }
        }
        Ok(changed)
    }

    /// Drops outgoing records that only echo what this session just
    /// persisted from the peer.
    ///
    /// An outgoing record is an echo if an incoming record with the same key
    /// was saved at exactly the outgoing record's tick and both carry the same
    /// per-field tick sum. Returns how many records were removed.
    pub fn remove_echoed_changes(&self) -> CoreResult<usize> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(self.closed_error());
        }
        let persisted: HashMap<RecordKey, (SyncTick, Option<i64>)> = inner
            .records
            .iter()
            .filter(|s| s.change.direction == Direction::Incoming)
            .filter_map(|s| {
                s.change
                    .saved_at_sync_tick
                    .map(|saved| (s.change.key(), (saved, s.change.updated_at_by_field_sum)))
            })
            .collect();

        inner.outgoing_order = None;
        let before = inner.records.len();
        inner.records.retain(|s| {
            if s.change.direction != Direction::Outgoing {
                return true;
            }
            match persisted.get(&s.change.key()) {
                Some((saved, sum)) => {
                    *saved != s.change.sync_tick || *sum != s.change.updated_at_by_field_sum
                }
                None => true,
            }
        });
        Ok(before - inner.records.len())
    }

    fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.records.clear();
        inner.outgoing_order = None;
    }
}

fn ordered_outgoing(records: &[StagedChange]) -> Vec<ChangeRecord> {
    let mut ordered: Vec<ChangeRecord> = records
        .iter()
        .filter(|s| s.change.direction == Direction::Outgoing)
        .map(|s| s.change.clone())
        .collect();
    ordered.sort_by(|a, b| {
        a.sync_tick
            .cmp(&b.sync_tick)
            .then_with(|| a.record_type.cmp(&b.record_type))
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
    ordered
}

/// Arena of staging areas keyed by session ID.
#[derive(Debug, Default)]
pub struct SnapshotSessionStore {
    areas: Mutex<HashMap<String, Arc<StagingArea>>>,
}

impl SnapshotSessionStore {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh staging area for `session_id`.
    ///
    /// An area already open under the same ID is closed and replaced.
    pub fn open(&self, session_id: &str) -> CoreResult<Arc<StagingArea>> {
        validate_session_id(session_id)?;
        let area = Arc::new(StagingArea::new(session_id.to_string()));
        let previous = self
            .areas
            .lock()
            .insert(session_id.to_string(), Arc::clone(&area));
        if let Some(previous) = previous {
            warn!(session_id, "staging area reopened, discarding previous contents");
            previous.close();
        }
        debug!(session_id, "staging area opened");
        Ok(area)
    }

    /// Returns the open staging area for `session_id`.
    pub fn get(&self, session_id: &str) -> CoreResult<Arc<StagingArea>> {
        self.areas
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::StagingAreaMissing {
                session_id: session_id.to_string(),
            })
    }

    /// Returns true if an area is open for `session_id`.
    pub fn exists(&self, session_id: &str) -> bool {
        self.areas.lock().contains_key(session_id)
    }

    /// Irreversibly drops the area. Closing a missing area is not an error.
    pub fn close(&self, session_id: &str) -> CoreResult<()> {
        validate_session_id(session_id)?;
        if let Some(area) = self.areas.lock().remove(session_id) {
            area.close();
            debug!(session_id, "staging area closed");
        }
        Ok(())
    }

    /// Drops every open area. Returns how many were dropped.
    pub fn drop_all(&self) -> usize {
        let areas: Vec<_> = self.areas.lock().drain().collect();
        for (_, area) in &areas {
            area.close();
        }
        areas.len()
    }

    /// Number of open areas.
    pub fn len(&self) -> usize {
        self.areas.lock().len()
    }

    /// Returns true if no area is open.
    pub fn is_empty(&self) -> bool {
        self.areas.lock().is_empty()
    }
}
