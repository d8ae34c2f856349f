//! Writing reconciled incoming changes into the live store.

use crate::clock::TickStamp;
use crate::error::{CoreError, CoreResult};
use crate::model::ModelSchema;
use crate::reconcile::{merge_for_model, MergeSource, VersionedRecord};
use crate::store::StoreTransaction;
use outpost_protocol::{ChangeRecord, SyncTick};
use tracing::debug;

/// How saved records are stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampPolicy {
    /// Central node: every written record is stamped with the session's tock.
    Central {
        /// Tick to stamp with.
        tock: SyncTick,
    },
    /// Facility node: records taken from central are marked as such; records
    /// mixing local and central fields are stamped as local edits so they are
    /// pushed back.
    Facility,
}

/// Counts of what a save did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    /// Records that did not exist before.
    pub created: usize,
    /// Existing records that changed.
    pub updated: usize,
    /// Existing records that became deleted.
    pub deleted: usize,
    /// Deleted records that came back.
    pub restored: usize,
    /// Records where the stored version won.
    pub unchanged: usize,
}

impl SaveStats {
    /// Records written to the live store.
    pub fn written(&self) -> usize {
        self.created + self.updated + self.deleted + self.restored
    }

    /// Adds another batch's counts.
    pub fn absorb(&mut self, other: SaveStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.restored += other.restored;
        self.unchanged += other.unchanged;
    }
}

enum Action {
    Create,
    Update,
    Delete,
    Restore,
}

/// Saves incoming changes for one model inside `tx`.
///
/// Each change is merged against the stored version and classified as a
/// create, update, delete or restore. Changes where the stored version wins
/// are left alone.
pub fn save_changes_for_model(
    tx: &mut StoreTransaction<'_>,
    schema: &ModelSchema,
    changes: &[ChangeRecord],
    policy: StampPolicy,
) -> CoreResult<SaveStats> {
    let mut stats = SaveStats::default();

    for change in changes {
        if change.record_type != schema.name {
            return Err(CoreError::invalid_record(
                change.key(),
                format!("saved as {}", schema.name),
            ));
        }

        let incoming = VersionedRecord {
            data: change.data.clone(),
            tick: change.sync_tick,
            is_deleted: change.is_deleted,
        };

        let (record, source, action) = match tx.get(&schema.name, &change.record_id) {
            None => (incoming, MergeSource::Incoming, Action::Create),
            Some(live) => {
                let existing = VersionedRecord {
                    data: live.data,
                    tick: live.updated_at_sync_tick,
                    is_deleted: live.is_deleted,
                };
                let outcome = merge_for_model(schema, &existing, &incoming);
                if outcome.source == MergeSource::Existing {
                    stats.unchanged += 1;
                    continue;
                }
                let action = match (existing.is_deleted, outcome.record.is_deleted) {
                    (false, true) => Action::Delete,
                    (true, false) => Action::Restore,
                    _ => Action::Update,
                };
                (outcome.record, outcome.source, action)
            }
        };

        let stamp = match (policy, source) {
            (StampPolicy::Central { tock }, _) => TickStamp::Explicit(tock),
            (StampPolicy::Facility, MergeSource::Mixed) => TickStamp::Current,
            (StampPolicy::Facility, _) => TickStamp::Explicit(SyncTick::INCOMING_FROM_CENTRAL),
        };
        tx.put(
            &schema.name,
            &change.record_id,
            record.data,
            record.is_deleted,
            stamp,
        );

        match action {
            Action::Create => stats.created += 1,
            Action::Update => stats.updated += 1,
            Action::Delete => stats.deleted += 1,
            Action::Restore => stats.restored += 1,
        }
    }

    debug!(
        model = %schema.name,
        created = stats.created,
        updated = stats.updated,
        deleted = stats.deleted,
        restored = stats.restored,
        unchanged = stats.unchanged,
        "saved incoming changes"
    );
    Ok(stats)
}
