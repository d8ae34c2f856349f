//! Property-based test generators using proptest.
//!
//! Strategies here produce records that satisfy the engine's assumptions:
//! safe IDs, non-sentinel ticks and well-formed per-field tick maps.

use outpost_core::VersionedRecord;
use outpost_protocol::{ChangeRecord, Direction, RecordData, SyncTick, FIELD_TICKS_KEY};
use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

/// Columns used by generated records.
pub const COLUMNS: [&str; 4] = ["name", "phone", "village", "status"];

/// Strategy for record IDs.
pub fn record_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for ordinary (non-sentinel) ticks.
pub fn tick_strategy() -> impl Strategy<Value = SyncTick> {
    (0i64..10_000).prop_map(SyncTick::new)
}

/// Strategy for a column value.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        prop::string::string_regex("[A-Za-z ]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// Strategy for record data over a subset of [`COLUMNS`].
pub fn record_data_strategy() -> impl Strategy<Value = RecordData> {
    prop::collection::btree_map(prop::sample::select(COLUMNS.to_vec()), value_strategy(), 1..=4)
        .prop_map(|columns| {
            columns
                .into_iter()
                .map(|(column, value)| (column.to_string(), value))
                .collect()
        })
}

/// Strategy for record data carrying a per-field tick for every column.
pub fn field_ticked_data_strategy() -> impl Strategy<Value = RecordData> {
    record_data_strategy().prop_flat_map(|data| {
        let n = data.len();
        (Just(data), prop::collection::vec(0i64..1_000, n)).prop_map(|(mut data, ticks)| {
            let map: BTreeMap<String, Value> = data
                .keys()
                .cloned()
                .zip(ticks.into_iter().map(Value::from))
                .collect();
            data.insert(FIELD_TICKS_KEY.to_string(), Value::Object(map.into_iter().collect()));
            data
        })
    })
}

/// Strategy for a record version with per-field ticks.
pub fn versioned_record_strategy() -> impl Strategy<Value = VersionedRecord> {
    (field_ticked_data_strategy(), tick_strategy(), any::<bool>())
        .prop_map(|(data, tick, deleted)| VersionedRecord::new(data, tick).with_deleted(deleted))
}

/// Strategy for outgoing `patients` changes, sorted by tick then key and
/// with unique IDs.
pub fn change_batch_strategy(max: usize) -> impl Strategy<Value = Vec<ChangeRecord>> {
    prop::collection::btree_map(record_id_strategy(), (record_data_strategy(), tick_strategy()), 0..max)
        .prop_map(|records| {
            let mut changes: Vec<ChangeRecord> = records
                .into_iter()
                .map(|(id, (data, tick))| {
                    ChangeRecord::new(Direction::Outgoing, "patients", id, data, tick)
                })
                .collect();
            changes.sort_by(|a, b| a.sync_tick.cmp(&b.sync_tick).then_with(|| a.key().cmp(&b.key())));
            changes
        })
}
