//! Change records exchanged during a sync session.

use crate::tick::SyncTick;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Column values of a record, keyed by column name.
pub type RecordData = serde_json::Map<String, Value>;

/// Name of the data column that carries per-field tick metadata.
pub const FIELD_TICKS_KEY: &str = "updated_at_by_field";

/// Which way a change record travels relative to the node holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Selected from the local live store, to be sent to the peer.
    Outgoing,
    /// Received from the peer, to be merged into the local live store.
    Incoming,
}

/// Identity of a record across all models.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Model name.
    pub record_type: String,
    /// Record ID within the model.
    pub record_id: String,
}

impl RecordKey {
    /// Creates a new record key.
    pub fn new(record_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.record_id)
    }
}

/// Per-field tick metadata as found in a record's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTicks {
    /// The record carries no per-field metadata.
    Absent,
    /// Tick of the last write to each field.
    Present(BTreeMap<String, SyncTick>),
    /// The metadata column exists but cannot be read as a field → tick map.
    Malformed,
}

impl FieldTicks {
    /// Reads the per-field tick metadata from record data.
    ///
    /// Tick values may be JSON integers or integer strings.
    pub fn parse(data: &RecordData) -> Self {
        let map = match data.get(FIELD_TICKS_KEY) {
            None | Some(Value::Null) => return FieldTicks::Absent,
            Some(Value::Object(map)) => map,
            Some(_) => return FieldTicks::Malformed,
        };

        let mut ticks = BTreeMap::new();
        for (field, value) in map {
            let tick = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            };
            match tick {
                Some(t) => {
                    ticks.insert(field.clone(), SyncTick::new(t));
                }
                None => return FieldTicks::Malformed,
            }
        }
        FieldTicks::Present(ticks)
    }

    /// Returns the tick map if the metadata is present and well formed.
    pub fn as_map(&self) -> Option<&BTreeMap<String, SyncTick>> {
        match self {
            FieldTicks::Present(map) => Some(map),
            _ => None,
        }
    }

    /// Sum of all field ticks, used to detect field-level drift cheaply.
    ///
    /// Wraps on overflow; the sum is a checksum, not a tick.
    pub fn sum(&self) -> Option<i64> {
        self.as_map().map(|map| {
            map.values()
                .fold(0i64, |acc, t| acc.wrapping_add(t.as_i64()))
        })
    }

    /// Converts a tick map back into its JSON column value.
    pub fn to_value(map: &BTreeMap<String, SyncTick>) -> Value {
        Value::Object(
            map.iter()
                .map(|(field, tick)| (field.clone(), Value::from(tick.as_i64())))
                .collect(),
        )
    }
}

/// A single change travelling through a sync session.
///
/// Change records live only inside a session's staging area (or in flight
/// on the wire); they are dropped together with the staging area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Outgoing or incoming.
    pub direction: Direction,
    /// Model name.
    pub record_type: String,
    /// Record ID within the model.
    pub record_id: String,
    /// Whether the record is (soft) deleted.
    pub is_deleted: bool,
    /// Column values as transmitted.
    pub data: RecordData,
    /// Tick the record was last updated at on the sending node.
    pub sync_tick: SyncTick,
    /// Tick at which an incoming record was persisted during this session.
    #[serde(default)]
    pub saved_at_sync_tick: Option<SyncTick>,
    /// Sum of the record's per-field ticks, if it carries them.
    #[serde(default)]
    pub updated_at_by_field_sum: Option<i64>,
}

impl ChangeRecord {
    /// Creates a new change record.
    pub fn new(
        direction: Direction,
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        data: RecordData,
        sync_tick: SyncTick,
    ) -> Self {
        let updated_at_by_field_sum = FieldTicks::parse(&data).sum();
        Self {
            direction,
            record_type: record_type.into(),
            record_id: record_id.into(),
            is_deleted: false,
            data,
            sync_tick,
            saved_at_sync_tick: None,
            updated_at_by_field_sum,
        }
    }

    /// Marks the record as deleted.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }

    /// Returns the same change with a different direction.
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Returns the record key.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.clone(), self.record_id.clone())
    }

    /// Returns true if this record has the given key.
    pub fn has_key(&self, key: &RecordKey) -> bool {
        self.record_type == key.record_type && self.record_id == key.record_id
    }

    /// Reads the per-field tick metadata from the data.
    pub fn field_ticks(&self) -> FieldTicks {
        FieldTicks::parse(&self.data)
    }

    /// Recomputes `updated_at_by_field_sum` from the current data.
    pub fn refresh_field_sum(&mut self) {
        self.updated_at_by_field_sum = self.field_ticks().sum();
    }
}
