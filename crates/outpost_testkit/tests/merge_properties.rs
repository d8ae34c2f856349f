//! Property tests for record reconciliation.

use outpost_core::{merge, merge_outcome, MergePolicy, MergeSource, VersionedRecord};
use outpost_protocol::FieldTicks;
use outpost_testkit::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn merging_a_record_with_itself_keeps_it(record in versioned_record_strategy()) {
        let outcome = merge_outcome(&record, &record);
        prop_assert_eq!(outcome.policy, MergePolicy::PerField);
        prop_assert_eq!(outcome.source, MergeSource::Existing);
        prop_assert_eq!(outcome.record, record);
    }

    #[test]
    fn remerging_changes_nothing(
        existing in versioned_record_strategy(),
        incoming in versioned_record_strategy(),
    ) {
        let merged = merge(&existing, &incoming);
        let again = merge(&merged, &incoming);
        prop_assert_eq!(again, merged);
    }

    #[test]
    fn field_ticks_never_go_backwards(
        existing in versioned_record_strategy(),
        incoming in versioned_record_strategy(),
    ) {
        let merged = merge(&existing, &incoming);
        let merged_ticks = match FieldTicks::parse(&merged.data) {
            FieldTicks::Present(map) => map,
            other => return Err(TestCaseError::fail(format!("{other:?}"))),
        };
        for side in [&existing, &incoming] {
            if let FieldTicks::Present(ticks) = side.field_ticks() {
                for (field, tick) in ticks {
                    prop_assert!(merged_ticks[&field] >= tick);
                }
            }
        }
        prop_assert_eq!(merged.tick, existing.tick.max(incoming.tick));
    }

    #[test]
    fn newer_whole_record_wins(
        existing in versioned_record_strategy(),
        data in record_data_strategy(),
    ) {
        let newer = VersionedRecord::new(data, outpost_protocol::SyncTick::new(existing.tick.as_i64() + 1));
        let outcome = merge_outcome(&existing, &newer);
        prop_assert_eq!(outcome.policy, MergePolicy::WholeRecord);
        prop_assert_eq!(outcome.record, newer);
    }
}
