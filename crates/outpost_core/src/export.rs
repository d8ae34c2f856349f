//! Selecting outgoing changes from the live store.

use crate::error::{CoreError, CoreResult};
use crate::model::ModelSchema;
use crate::planner::{NestedRecord, RelationPlanner, SyncPlan};
use crate::store::{LiveRecord, LiveStore};
use outpost_protocol::{ChangeRecord, Direction, RecordData, SyncTick};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Tick bounds of an export: `since < tick <= until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportWindow {
    /// Exclusive lower bound.
    pub since: SyncTick,
    /// Inclusive upper bound, if any.
    pub until: Option<SyncTick>,
}

impl ExportWindow {
    /// Everything written after `since`.
    pub fn since(since: SyncTick) -> Self {
        Self { since, until: None }
    }

    /// Everything written after `since` up to and including `until`.
    pub fn between(since: SyncTick, until: SyncTick) -> Self {
        Self {
            since,
            until: Some(until),
        }
    }

    fn contains(&self, tick: SyncTick) -> bool {
        tick > self.since && self.until.map_or(true, |u| tick <= u)
    }
}

type ChildIndex = HashMap<String, Vec<LiveRecord>>;

struct Exporter<'a> {
    store: &'a LiveStore,
    index: HashMap<(String, String), ChildIndex>,
}

impl Exporter<'_> {
    fn children(&mut self, model: &str, foreign_key: &str, parent_id: &str) -> Vec<LiveRecord> {
        let store = self.store;
        let index = self
            .index
            .entry((model.to_string(), foreign_key.to_string()))
            .or_insert_with(|| {
                let mut index: ChildIndex = HashMap::new();
                for record in store.records(model) {
                    if let Some(Value::String(parent)) = record.data.get(foreign_key) {
                        index.entry(parent.clone()).or_default().push(record);
                    }
                }
                index
            });
        index.get(parent_id).cloned().unwrap_or_default()
    }

    /// Pruned data with children nested, and the greatest tick in the tree.
    fn export(&mut self, plan: &SyncPlan, record: &LiveRecord) -> CoreResult<(RecordData, SyncTick)> {
        let mut data = plan.prune(&record.data);
        let mut tick = record.updated_at_sync_tick;

        for (relation, child_plan) in &plan.children {
            let Some(foreign_key) = child_plan.foreign_key.as_deref() else {
                continue;
            };
            let mut nested = Vec::new();
            for child in self.children(&child_plan.model, foreign_key, &record.id) {
                let (child_data, child_tick) = self.export(child_plan, &child)?;
                tick = tick.max(child_tick);
                let entry = NestedRecord {
                    id: child.id.clone(),
                    is_deleted: child.is_deleted,
                    sync_tick: child.updated_at_sync_tick,
                    data: child_data,
                };
                nested.push(serde_json::to_value(entry).map_err(|e| {
                    CoreError::invalid_record(
                        format!("{}/{}", child_plan.model, child.id),
                        e.to_string(),
                    )
                })?);
            }
            data.insert(relation.clone(), Value::Array(nested));
        }
        Ok((data, tick))
    }
}

/// Outgoing changes of `models` within `window`, ordered by tick then key.
///
/// Models that only travel nested under a parent are skipped; their records
/// are exported inside the parent, and a change to a child makes the parent
/// travel again.
pub fn collect_outgoing_changes(
    store: &LiveStore,
    planner: &RelationPlanner,
    models: &[Arc<ModelSchema>],
    window: ExportWindow,
) -> CoreResult<Vec<ChangeRecord>> {
    let mut exporter = Exporter {
        store,
        index: HashMap::new(),
    };
    let mut changes = Vec::new();

    for schema in models.iter().filter(|m| m.is_standalone()) {
        let plan = planner.build_plan(&schema.name)?;
        let candidates = if plan.children.is_empty() {
            store.changed_between(&schema.name, window.since, window.until)
        } else {
            store.records(&schema.name)
        };

        let before = changes.len();
        for record in candidates {
            let (data, tick) = exporter.export(&plan, &record)?;
            if !window.contains(tick) {
                continue;
            }
            let mut change =
                ChangeRecord::new(Direction::Outgoing, schema.name.clone(), record.id, data, tick);
            change.is_deleted = record.is_deleted;
            changes.push(change);
        }
        debug!(model = %schema.name, count = changes.len() - before, "collected outgoing changes");
    }

    changes.sort_by(|a, b| {
        a.sync_tick
            .cmp(&b.sync_tick)
            .then_with(|| a.key().cmp(&b.key()))
    });
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{TickClock, TickStamp};
    use crate::model::{ModelRegistry, RelationTree};
    use serde_json::json;

    fn data(value: Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new()
                .with_model(
                    ModelSchema::new("patients")
                        .with_attributes(["id", "name", "secret"])
                        .excluding(["secret"])
                        .with_relation("encounters", "encounters", "patient_id")
                        .with_sync_relations(RelationTree::new().with("encounters", RelationTree::new())),
                )
                .with_model(
                    ModelSchema::new("encounters")
                        .with_attributes(["id", "patient_id", "reason"])
                        .with_parent_foreign_key("patient_id"),
                )
                .with_model(ModelSchema::new("facilities").with_attributes(["id", "name"])),
        )
    }

    fn put(store: &LiveStore, model: &str, id: &str, value: Value, tick: i64) {
        store
            .write(|tx| {
                tx.put(model, id, data(value), false, TickStamp::Explicit(SyncTick::new(tick)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn exports_pruned_and_ordered() {
        let registry = registry();
        let planner = RelationPlanner::new(Arc::clone(&registry));
        let store = LiveStore::new(Arc::new(TickClock::default()));
        put(&store, "patients", "p2", json!({"id": "p2", "name": "B", "secret": 1}), 4);
        put(&store, "patients", "p1", json!({"id": "p1", "name": "A", "secret": 1}), 4);
        put(&store, "facilities", "f1", json!({"id": "f1", "name": "Clinic"}), 2);
        put(&store, "facilities", "old", json!({"id": "old"}), 1);

        let models: Vec<_> = registry.iter().cloned().collect();
        let changes =
            collect_outgoing_changes(&store, &planner, &models, ExportWindow::since(SyncTick::new(1)))
                .unwrap();

        let keys: Vec<_> = changes.iter().map(|c| c.key().to_string()).collect();
        assert_eq!(keys, vec!["facilities/f1", "patients/p1", "patients/p2"]);
        assert_eq!(changes[1].data.get("secret"), None);
        assert_eq!(changes[1].data["encounters"], json!([]));
        assert!(changes.iter().all(|c| c.direction == Direction::Outgoing));
    }

    #[test]
    fn changed_child_makes_parent_travel() {
        let registry = registry();
        let planner = RelationPlanner::new(Arc::clone(&registry));
        let store = LiveStore::new(Arc::new(TickClock::default()));
        put(&store, "patients", "p1", json!({"id": "p1", "name": "A"}), 2);
        put(&store, "encounters", "e1", json!({"id": "e1", "patient_id": "p1", "reason": "cough"}), 9);

        let models: Vec<_> = registry.iter().cloned().collect();
        let changes =
            collect_outgoing_changes(&store, &planner, &models, ExportWindow::between(SyncTick::new(5), SyncTick::new(9)))
                .unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].record_id, "p1");
        assert_eq!(changes[0].sync_tick, SyncTick::new(9));
        let nested = changes[0].data["encounters"].as_array().unwrap();
        assert_eq!(nested[0]["id"], json!("e1"));
        assert_eq!(nested[0]["data"]["reason"], json!("cough"));

        let none = collect_outgoing_changes(&store, &planner, &models, ExportWindow::between(SyncTick::new(5), SyncTick::new(8)))
            .unwrap();
        assert!(none.is_empty());
    }
}
