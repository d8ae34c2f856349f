//! Merging a stored record with an incoming version of it.
//!
//! Two policies exist:
//!
//! - **Whole record**: the version with the strictly greater tick wins in
//!   full. A tie keeps the stored version.
//! - **Per field**: when both versions carry per-field ticks, each field is
//!   taken from whichever side wrote it last. The merged tick map is the
//!   field-wise max and the merged tick is the max of both ticks.
//!
//! Malformed per-field metadata never fails a merge; it degrades to the
//! whole-record policy.

use crate::model::ModelSchema;
use outpost_protocol::{FieldTicks, RecordData, SyncTick, FIELD_TICKS_KEY};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// A record version taking part in a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    /// Column values, including the per-field tick column if present.
    pub data: RecordData,
    /// Tick the version was written at.
    pub tick: SyncTick,
    /// Whether the version is soft deleted.
    pub is_deleted: bool,
}

impl VersionedRecord {
    /// Creates a live (not deleted) version.
    pub fn new(data: RecordData, tick: SyncTick) -> Self {
        Self {
            data,
            tick,
            is_deleted: false,
        }
    }

    /// Sets the deleted flag.
    #[must_use]
    pub fn with_deleted(mut self, is_deleted: bool) -> Self {
        self.is_deleted = is_deleted;
        self
    }

    /// Reads this version's per-field ticks.
    pub fn field_ticks(&self) -> FieldTicks {
        FieldTicks::parse(&self.data)
    }

    /// Sum of this version's per-field ticks.
    pub fn updated_at_by_field_sum(&self) -> Option<i64> {
        self.field_ticks().sum()
    }
}

/// How two versions of a record are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Strictly greater tick wins the whole record.
    WholeRecord,
    /// Last write wins for each field separately.
    PerField,
}

/// Which side the merged record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// The stored version is kept unchanged.
    Existing,
    /// The incoming version replaces the stored one.
    Incoming,
    /// Fields from both versions were combined.
    Mixed,
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The merged version.
    pub record: VersionedRecord,
    /// Where it came from.
    pub source: MergeSource,
    /// The policy that was applied.
    pub policy: MergePolicy,
}

/// Chooses the merge policy for two versions.
pub fn merge_policy(existing: &VersionedRecord, incoming: &VersionedRecord) -> MergePolicy {
    match (existing.field_ticks(), incoming.field_ticks()) {
        (FieldTicks::Present(_), FieldTicks::Present(_)) => MergePolicy::PerField,
        (FieldTicks::Malformed, _) | (_, FieldTicks::Malformed) => {
            warn!(
                existing_tick = existing.tick.as_i64(),
                incoming_tick = incoming.tick.as_i64(),
                "malformed per-field ticks, falling back to whole-record merge"
            );
            MergePolicy::WholeRecord
        }
        _ => MergePolicy::WholeRecord,
    }
}

/// Merges `incoming` into `existing`.
pub fn merge(existing: &VersionedRecord, incoming: &VersionedRecord) -> VersionedRecord {
    merge_outcome(existing, incoming).record
}

/// Merges `incoming` into `existing`, reporting where the result came from.
pub fn merge_outcome(existing: &VersionedRecord, incoming: &VersionedRecord) -> MergeOutcome {
    let policy = merge_policy(existing, incoming);
    merge_with(policy, existing, incoming)
}

/// Merges for a given model. Models without per-field tick support always
/// use the whole-record policy.
pub fn merge_for_model(
    schema: &ModelSchema,
    existing: &VersionedRecord,
    incoming: &VersionedRecord,
) -> MergeOutcome {
    if schema.field_ticks {
        merge_outcome(existing, incoming)
    } else {
        merge_with(MergePolicy::WholeRecord, existing, incoming)
    }
}

fn merge_with(
    policy: MergePolicy,
    existing: &VersionedRecord,
    incoming: &VersionedRecord,
) -> MergeOutcome {
    let (existing_ticks, incoming_ticks) = match (existing.field_ticks(), incoming.field_ticks()) {
        (FieldTicks::Present(e), FieldTicks::Present(i)) if policy == MergePolicy::PerField => {
            (e, i)
        }
        _ => return merge_whole_record(existing, incoming),
    };

    let mut merged_ticks: BTreeMap<String, SyncTick> = existing_ticks.clone();
    for (field, tick) in &incoming_ticks {
        let entry = merged_ticks.entry(field.clone()).or_insert(*tick);
        if *tick > *entry {
            *entry = *tick;
        }
    }

    let fields: BTreeSet<&String> = existing
        .data
        .keys()
        .chain(incoming.data.keys())
        .filter(|k| k.as_str() != FIELD_TICKS_KEY)
        .collect();

    let zero = SyncTick::new(0);
    let mut data = RecordData::new();
    for field in fields {
        let existing_tick = existing_ticks.get(field).copied().unwrap_or(zero);
        let incoming_tick = incoming_ticks.get(field).copied().unwrap_or(zero);
        let value: Option<&Value> = if incoming_tick > existing_tick {
            incoming.data.get(field).or_else(|| existing.data.get(field))
        } else {
            existing.data.get(field).or_else(|| incoming.data.get(field))
        };
        if let Some(value) = value {
            data.insert(field.clone(), value.clone());
        }
    }
    data.insert(
        FIELD_TICKS_KEY.to_string(),
        FieldTicks::to_value(&merged_ticks),
    );

    let is_deleted = if incoming.tick > existing.tick {
        incoming.is_deleted
    } else {
        existing.is_deleted
    };
    let record = VersionedRecord {
        data,
        tick: existing.tick.max(incoming.tick),
        is_deleted,
    };

    let source = if same_version(&record, existing) {
        MergeSource::Existing
    } else if same_version(&record, incoming) {
        MergeSource::Incoming
    } else {
        MergeSource::Mixed
    };

    MergeOutcome {
        record,
        source,
        policy: MergePolicy::PerField,
    }
}

fn merge_whole_record(existing: &VersionedRecord, incoming: &VersionedRecord) -> MergeOutcome {
    let (record, source) = if incoming.tick > existing.tick {
        (incoming.clone(), MergeSource::Incoming)
    } else {
        (existing.clone(), MergeSource::Existing)
    };
    MergeOutcome {
        record,
        source,
        policy: MergePolicy::WholeRecord,
    }
}

// Compares ignoring how the per-field tick column happens to be spelled.
fn same_version(a: &VersionedRecord, b: &VersionedRecord) -> bool {
    if a.tick != b.tick || a.is_deleted != b.is_deleted {
        return false;
    }
    if a.field_ticks() != b.field_ticks() {
        return false;
    }
    let strip = |data: &RecordData| -> BTreeMap<String, Value> {
        data.iter()
            .filter(|(k, _)| k.as_str() != FIELD_TICKS_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    strip(&a.data) == strip(&b.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn version(value: Value, tick: i64) -> VersionedRecord {
        VersionedRecord::new(value.as_object().cloned().unwrap(), SyncTick::new(tick))
    }

    #[test]
    fn per_field_last_write_wins() {
        let existing = version(json!({"a": 1, "b": 2, FIELD_TICKS_KEY: {"a": 1, "b": 3}}), 3);
        let incoming = version(json!({"a": 9, "b": 2, FIELD_TICKS_KEY: {"a": 5, "b": 2}}), 5);

        let outcome = merge_outcome(&existing, &incoming);
        assert_eq!(outcome.policy, MergePolicy::PerField);
        assert_eq!(outcome.source, MergeSource::Mixed);
        assert_eq!(outcome.record.data["a"], json!(9));
        assert_eq!(outcome.record.data["b"], json!(2));
        assert_eq!(
            outcome.record.data[FIELD_TICKS_KEY],
            json!({"a": 5, "b": 3})
        );
        assert_eq!(outcome.record.tick, SyncTick::new(5));
    }

    #[test]
    fn edits_to_different_fields_both_survive() {
        let existing = version(json!({"a": "local", "b": 0, FIELD_TICKS_KEY: {"a": 7, "b": 1}}), 7);
        let incoming = version(json!({"a": 0, "b": "remote", FIELD_TICKS_KEY: {"a": 1, "b": 6}}), 6);

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.data["a"], json!("local"));
        assert_eq!(merged.data["b"], json!("remote"));
        assert_eq!(merged.tick, SyncTick::new(7));
    }

    #[test]
    fn whole_record_tie_keeps_existing() {
        let existing = version(json!({"a": 1}), 4);
        let incoming = version(json!({"a": 2}), 4);
        let outcome = merge_outcome(&existing, &incoming);
        assert_eq!(outcome.record, existing);
        assert_eq!(outcome.source, MergeSource::Existing);
    }

    #[test]
    fn whole_record_greater_tick_wins() {
        let existing = version(json!({"a": 1}), 4);
        let incoming = version(json!({"a": 2}), 5).with_deleted(true);
        let outcome = merge_outcome(&existing, &incoming);
        assert_eq!(outcome.record, incoming);
        assert_eq!(outcome.source, MergeSource::Incoming);
    }

    #[test]
    fn one_sided_metadata_uses_whole_record() {
        let existing = version(json!({"a": 1, FIELD_TICKS_KEY: {"a": 9}}), 9);
        let incoming = version(json!({"a": 2}), 10);
        assert_eq!(merge_policy(&existing, &incoming), MergePolicy::WholeRecord);
        assert_eq!(merge(&existing, &incoming), incoming);
    }

    #[test]
    fn malformed_metadata_degrades() {
        let existing = version(json!({"a": 1, FIELD_TICKS_KEY: "garbage"}), 3);
        let incoming = version(json!({"a": 2, FIELD_TICKS_KEY: {"a": 1}}), 2);
        let outcome = merge_outcome(&existing, &incoming);
        assert_eq!(outcome.policy, MergePolicy::WholeRecord);
        assert_eq!(outcome.record, existing);
    }

    #[test]
    fn model_without_field_ticks_forces_whole_record() {
        let schema = ModelSchema::new("patients");
        let existing = version(json!({"a": 1, FIELD_TICKS_KEY: {"a": 9}}), 3);
        let incoming = version(json!({"a": 2, FIELD_TICKS_KEY: {"a": 1}}), 4);
        let outcome = merge_for_model(&schema, &existing, &incoming);
        assert_eq!(outcome.policy, MergePolicy::WholeRecord);
        assert_eq!(outcome.record.data["a"], json!(2));
    }

    fn arb_version(with_ticks: bool) -> impl Strategy<Value = VersionedRecord> {
        let fields = prop::collection::btree_map("[a-d]", (0i64..5, 0i64..20), 0..4);
        (fields, 0i64..25, any::<bool>()).prop_map(move |(fields, tick, deleted)| {
            let mut data = RecordData::new();
            let mut ticks = serde_json::Map::new();
            for (name, (value, field_tick)) in fields {
                data.insert(name.clone(), json!(value));
                ticks.insert(name, json!(field_tick));
            }
            if with_ticks {
                data.insert(FIELD_TICKS_KEY.to_string(), Value::Object(ticks));
            }
            VersionedRecord::new(data, SyncTick::new(tick)).with_deleted(deleted)
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(
            (a, b) in (any::<bool>(), any::<bool>())
                .prop_flat_map(|(x, y)| (arb_version(x), arb_version(y))),
        ) {
            let once = merge(&a, &b);
            let twice = merge(&once, &b);
            prop_assert_eq!(twice, once);
        }

        #[test]
        fn equal_ticks_keep_existing_without_metadata(
            a in arb_version(false),
            b in arb_version(false),
        ) {
            let b = VersionedRecord { tick: a.tick, ..b };
            prop_assert_eq!(merge(&a, &b), a);
        }
    }
}
