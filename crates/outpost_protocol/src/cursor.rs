//! Pagination cursors.

use crate::record::{ChangeRecord, RecordKey};
use crate::tick::SyncTick;
use serde::{Deserialize, Serialize};

/// Position in a stream of changes ordered by `(sync_tick, record key)`.
///
/// A cursor points just past the last record that was seen. Because new
/// writes always receive a tick greater than anything already paginated
/// past, a cursor stays valid while writes continue to land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Highest tick seen so far.
    pub tick: SyncTick,
    /// Last record seen at `tick`; `None` means every record at `tick` has
    /// been seen.
    pub after: Option<RecordKey>,
}

impl Cursor {
    /// A cursor positioned after every record at or below `tick`.
    pub fn since(tick: SyncTick) -> Self {
        Self { tick, after: None }
    }

    /// A cursor positioned just after the given record.
    pub fn after_record(record: &ChangeRecord) -> Self {
        Self {
            tick: record.sync_tick,
            after: Some(record.key()),
        }
    }

    /// Returns true if a record at `(tick, key)` lies beyond this cursor.
    pub fn is_before(&self, tick: SyncTick, key: &RecordKey) -> bool {
        match tick.cmp(&self.tick) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match &self.after {
                None => false,
                Some(last) => key > last,
            },
        }
    }

    /// Advances the cursor past the last record of a page.
    ///
    /// The cursor never moves backwards.
    pub fn advance(&mut self, page: &[ChangeRecord]) {
        if let Some(last) = page.last() {
            if self.is_before(last.sync_tick, &last.key()) {
                *self = Self::after_record(last);
            }
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::since(SyncTick::ORIGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Direction, RecordData};

    fn record(tick: i64, id: &str) -> ChangeRecord {
        ChangeRecord::new(
            Direction::Outgoing,
            "patients",
            id,
            RecordData::new(),
            SyncTick::new(tick),
        )
    }

    #[test]
    fn since_excludes_records_at_the_tick() {
        let cursor = Cursor::since(SyncTick::new(5));
        assert!(!cursor.is_before(SyncTick::new(5), &RecordKey::new("patients", "a")));
        assert!(cursor.is_before(SyncTick::new(6), &RecordKey::new("patients", "a")));
    }

    #[test]
    fn after_record_splits_a_tick() {
        let cursor = Cursor::after_record(&record(5, "b"));
        assert!(!cursor.is_before(SyncTick::new(5), &RecordKey::new("patients", "a")));
        assert!(!cursor.is_before(SyncTick::new(5), &RecordKey::new("patients", "b")));
        assert!(cursor.is_before(SyncTick::new(5), &RecordKey::new("patients", "c")));
    }

    #[test]
    fn advance_moves_to_last_record_only_forwards() {
        let mut cursor = Cursor::default();
        cursor.advance(&[record(2, "a"), record(3, "b")]);
        assert_eq!(cursor, Cursor::after_record(&record(3, "b")));

        cursor.advance(&[record(1, "z")]);
        assert_eq!(cursor.tick, SyncTick::new(3));

        cursor.advance(&[]);
        assert_eq!(cursor.tick, SyncTick::new(3));
    }
}
