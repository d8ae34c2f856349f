//! The live store: current record versions plus node-local facts.
//!
//! ## Single-Writer Guarantee
//!
//! Only one [`StoreTransaction`] is active at a time. Beginning a transaction
//! takes the store's write lock and an advisory lock on the current tick;
//! both are released when the transaction is committed or dropped. Dropping
//! a transaction without committing discards its writes.

use crate::clock::{AdvisoryLock, TickClock, TickStamp};
use crate::error::{CoreError, CoreResult};
use outpost_protocol::{FieldTicks, RecordData, SyncTick, TickTock, FIELD_TICKS_KEY};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Current version of a record in the live store.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveRecord {
    /// Record ID.
    pub id: String,
    /// Column values.
    pub data: RecordData,
    /// Tick the record was last written at.
    pub updated_at_sync_tick: SyncTick,
    /// Whether the record is soft deleted.
    pub is_deleted: bool,
}

type Table = BTreeMap<String, LiveRecord>;

/// In-memory live store shared by application traffic and sync sessions.
#[derive(Debug)]
pub struct LiveStore {
    clock: Arc<TickClock>,
    tables: RwLock<BTreeMap<String, Table>>,
    facts: RwLock<BTreeMap<String, String>>,
    write_lock: Mutex<()>,
}

impl LiveStore {
    /// Creates an empty store driven by `clock`.
    pub fn new(clock: Arc<TickClock>) -> Self {
        Self {
            clock,
            tables: RwLock::new(BTreeMap::new()),
            facts: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// The clock stamping this store's writes.
    pub fn clock(&self) -> &Arc<TickClock> {
        &self.clock
    }

    /// Begins a write transaction, blocking while another one is active.
    pub fn begin(&self) -> StoreTransaction<'_> {
        let guard = self.write_lock.lock();
        let begin_lock = self.clock.hold_current();
        StoreTransaction {
            store: self,
            _guard: guard,
            begin_tick: begin_lock.tick(),
            locks: vec![begin_lock],
            writes: BTreeMap::new(),
            facts: BTreeMap::new(),
        }
    }

    /// Runs `f` in a transaction, committing if it returns `Ok`.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut StoreTransaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut tx = self.begin();
        let value = f(&mut tx)?;
        tx.commit();
        Ok(value)
    }

    /// Reads the committed version of a record.
    pub fn get(&self, model: &str, id: &str) -> Option<LiveRecord> {
        self.tables.read().get(model)?.get(id).cloned()
    }

    /// Committed records of `model` written after `since`, ordered by tick
    /// then ID.
    pub fn changed_since(&self, model: &str, since: SyncTick) -> Vec<LiveRecord> {
        self.changed_between(model, since, None)
    }

    /// Committed records of `model` with `since < tick <= until`, ordered by
    /// tick then ID.
    pub fn changed_between(
        &self,
        model: &str,
        since: SyncTick,
        until: Option<SyncTick>,
    ) -> Vec<LiveRecord> {
        let tables = self.tables.read();
        let mut records: Vec<LiveRecord> = tables
            .get(model)
            .map(|table| {
                table
                    .values()
                    .filter(|r| {
                        r.updated_at_sync_tick > since
                            && until.map_or(true, |u| r.updated_at_sync_tick <= u)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| {
            a.updated_at_sync_tick
                .cmp(&b.updated_at_sync_tick)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    /// All committed records of `model`, ordered by ID.
    pub fn records(&self, model: &str) -> Vec<LiveRecord> {
        self.tables
            .read()
            .get(model)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of committed records of `model`, deleted ones included.
    pub fn count(&self, model: &str) -> usize {
        self.tables.read().get(model).map_or(0, BTreeMap::len)
    }

    /// Reads a committed node-local fact.
    pub fn fact(&self, key: &str) -> Option<String> {
        self.facts.read().get(key).cloned()
    }

    /// Reads a committed fact holding a tick.
    pub fn tick_fact(&self, key: &str) -> CoreResult<Option<SyncTick>> {
        self.fact(key)
            .map(|value| {
                value
                    .parse::<i64>()
                    .map(SyncTick::new)
                    .map_err(|_| CoreError::invalid_record(key, format!("not a tick: {value}")))
            })
            .transpose()
    }
}

/// An open write transaction on a [`LiveStore`].
pub struct StoreTransaction<'a> {
    store: &'a LiveStore,
    _guard: MutexGuard<'a, ()>,
    begin_tick: SyncTick,
    locks: Vec<AdvisoryLock<'a>>,
    writes: BTreeMap<(String, String), LiveRecord>,
    facts: BTreeMap<String, String>,
}

impl<'a> StoreTransaction<'a> {
    /// Tick that was current when this transaction began.
    pub fn tick(&self) -> SyncTick {
        self.begin_tick
    }

    /// Advances the store's clock and returns the new current tick.
    pub fn next_tick(&mut self) -> SyncTick {
        self.store.clock.next_tick()
    }

    /// Advances the store's clock by two.
    ///
    /// The tock stays locked until this transaction ends, so writes stamped
    /// with it are waited for like any other.
    pub fn tick_tock(&mut self) -> TickTock {
        let (tick_tock, lock) = self.store.clock.hold_tick_tock();
        self.locks.push(lock);
        tick_tock
    }

    /// Reads a record, seeing this transaction's own writes.
    pub fn get(&self, model: &str, id: &str) -> Option<LiveRecord> {
        self.writes
            .get(&(model.to_string(), id.to_string()))
            .cloned()
            .or_else(|| self.store.get(model, id))
    }

    /// Writes a record version, stamped according to `stamp`.
    ///
    /// Returns the tick the record was stamped with.
    pub fn put(
        &mut self,
        model: &str,
        id: &str,
        data: RecordData,
        is_deleted: bool,
        stamp: TickStamp,
    ) -> SyncTick {
        let tick = self.store.clock.stamp(self.begin_tick, stamp);
        if !tick.is_sentinel() && !self.locks.iter().any(|l| l.tick() == tick) {
            self.locks.push(self.store.clock.hold_advisory_lock(tick));
        }
        self.writes.insert(
            (model.to_string(), id.to_string()),
            LiveRecord {
                id: id.to_string(),
                data,
                updated_at_sync_tick: tick,
                is_deleted,
            },
        );
        tick
    }

    /// Applies a local edit to some fields of a record, creating it if
    /// missing.
    ///
    /// If the record carries per-field ticks, the edited fields are stamped
    /// with this transaction's tick.
    pub fn update_fields(&mut self, model: &str, id: &str, changes: RecordData) -> SyncTick {
        let existing = self.get(model, id);
        let (mut data, is_deleted) = existing
            .map(|r| (r.data, r.is_deleted))
            .unwrap_or_default();

        let mut field_ticks = FieldTicks::parse(&data).as_map().cloned();
        for (field, value) in changes {
            if field == FIELD_TICKS_KEY {
                continue;
            }
            if let Some(ticks) = field_ticks.as_mut() {
                ticks.insert(field.clone(), self.begin_tick);
            }
            data.insert(field, value);
        }
        if let Some(ticks) = field_ticks {
            data.insert(FIELD_TICKS_KEY.to_string(), FieldTicks::to_value(&ticks));
        }
        self.put(model, id, data, is_deleted, TickStamp::Current)
    }

    /// Soft deletes a record. Returns false if it does not exist.
    pub fn delete(&mut self, model: &str, id: &str) -> bool {
        match self.get(model, id) {
            Some(record) => {
                self.put(model, id, record.data, true, TickStamp::Current);
                true
            }
            None => false,
        }
    }

    /// Writes a node-local fact.
    pub fn set_fact(&mut self, key: impl Into<String>, value: impl ToString) {
        self.facts.insert(key.into(), value.to_string());
    }

    /// Writes a fact holding a tick, readable with [`LiveStore::tick_fact`].
    pub fn set_tick_fact(&mut self, key: impl Into<String>, tick: SyncTick) {
        self.set_fact(key, tick.as_i64());
    }

    /// Reads a fact, seeing this transaction's own writes.
    pub fn fact(&self, key: &str) -> Option<String> {
        self.facts
            .get(key)
            .cloned()
            .or_else(|| self.store.fact(key))
    }

    /// Number of writes buffered in this transaction.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Applies all buffered writes atomically and releases the locks.
    pub fn commit(self) {
        {
            let mut tables = self.store.tables.write();
            for ((model, id), record) in self.writes {
                tables.entry(model).or_default().insert(id, record);
            }
        }
        if !self.facts.is_empty() {
            self.store.facts.write().extend(self.facts);
        }
        // Advisory locks and the writer guard are released on drop.
    }
}

impl std::fmt::Debug for StoreTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("begin_tick", &self.begin_tick)
            .field("pending_writes", &self.writes.len())
            .finish()
    }
}
