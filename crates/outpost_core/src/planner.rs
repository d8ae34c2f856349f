//! Relation planning: which columns travel and how children nest.

use crate::error::{CoreError, CoreResult};
use crate::model::{ModelRegistry, ModelSchema, RelationTree};
use outpost_protocol::{ChangeRecord, RecordData, SyncTick};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Resolved export/import plan for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    /// Model name.
    pub model: String,
    /// Columns that travel over the wire.
    pub columns: Vec<String>,
    /// Column on this model referencing its parent, for nested plans.
    pub foreign_key: Option<String>,
    /// Nested plans keyed by relation name.
    pub children: BTreeMap<String, Arc<SyncPlan>>,
}

impl SyncPlan {
    /// Number of models in this tree, this one included.
    pub fn model_count(&self) -> usize {
        1 + self.children.values().map(|c| c.model_count()).sum::<usize>()
    }

    /// Keeps only the plan's columns.
    pub fn prune(&self, data: &RecordData) -> RecordData {
        self.columns
            .iter()
            .filter_map(|c| data.get(c).map(|v| (c.clone(), v.clone())))
            .collect()
    }
}

/// A child record nested under its parent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedRecord {
    /// Record ID.
    pub id: String,
    /// Whether the record is soft deleted.
    #[serde(default)]
    pub is_deleted: bool,
    /// Tick the record was last written at.
    pub sync_tick: SyncTick,
    /// Pruned column values, with its own children nested.
    pub data: RecordData,
}

/// Builds and caches [`SyncPlan`]s.
///
/// Plans are immutable once built and shared by all sessions.
#[derive(Debug)]
pub struct RelationPlanner {
    registry: Arc<ModelRegistry>,
    cache: RwLock<HashMap<String, Arc<SyncPlan>>>,
}

impl RelationPlanner {
    /// Creates a planner over the given models.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The models this planner resolves against.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Returns the plan for `model`, building it on first use.
    ///
    /// Fails with a configuration error if any declared sync relation does
    /// not resolve.
    pub fn build_plan(&self, model: &str) -> CoreResult<Arc<SyncPlan>> {
        if let Some(plan) = self.cache.read().get(model) {
            return Ok(Arc::clone(plan));
        }

        let schema = self.registry.get(model)?;
        let plan = Arc::new(self.resolve(schema, &schema.sync_relations, None)?);
        self.cache
            .write()
            .entry(model.to_string())
            .or_insert_with(|| Arc::clone(&plan));
        Ok(plan)
    }

    /// Builds plans for every model, failing on the first bad relation.
    pub fn validate_all(&self) -> CoreResult<()> {
        for schema in self.registry.iter() {
            self.build_plan(&schema.name)?;
        }
        Ok(())
    }

    fn resolve(
        &self,
        schema: &ModelSchema,
        tree: &RelationTree,
        foreign_key: Option<String>,
    ) -> CoreResult<SyncPlan> {
        let mut children = BTreeMap::new();
        for (relation, subtree) in tree.iter() {
            let unresolved = || CoreError::UnresolvedRelation {
                model: schema.name.clone(),
                relation: relation.clone(),
            };
            let def = schema.relations.get(relation).ok_or_else(unresolved)?;
            let target = self.registry.get(&def.target).map_err(|_| unresolved())?;
            let child = self.resolve(target, subtree, Some(def.foreign_key.clone()))?;
            children.insert(relation.clone(), Arc::new(child));
        }

        Ok(SyncPlan {
            model: schema.name.clone(),
            columns: schema.synced_columns(),
            foreign_key,
            children,
        })
    }
}

/// Splits a record carrying nested children into one change per record.
///
/// Children inherit the parent's direction and get their foreign key set to
/// the parent's ID. Nested entries that cannot be read are rejected.
pub fn flatten(plan: &SyncPlan, record: &ChangeRecord) -> CoreResult<Vec<ChangeRecord>> {
    let mut out = Vec::new();
    flatten_into(plan, record, &mut out)?;
    Ok(out)
}

fn flatten_into(
    plan: &SyncPlan,
    record: &ChangeRecord,
    out: &mut Vec<ChangeRecord>,
) -> CoreResult<()> {
    let mut own = record.clone();
    own.data = plan.prune(&record.data);
    own.refresh_field_sum();
    out.push(own);

    for (relation, child_plan) in &plan.children {
        let entries = match record.data.get(relation) {
            None | Some(Value::Null) => continue,
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(CoreError::invalid_record(
                    record.key(),
                    format!("relation {relation} is not a list"),
                ))
            }
        };
        for entry in entries {
            let nested: NestedRecord = serde_json::from_value(entry.clone()).map_err(|e| {
                CoreError::invalid_record(record.key(), format!("nested {relation}: {e}"))
            })?;
            let mut data = nested.data;
            if let Some(fk) = &child_plan.foreign_key {
                data.insert(fk.clone(), Value::String(record.record_id.clone()));
            }
            let mut child = ChangeRecord::new(
                record.direction,
                child_plan.model.clone(),
                nested.id,
                data,
                nested.sync_tick,
            );
            child.is_deleted = nested.is_deleted;
            flatten_into(child_plan, &child, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSchema;
    use outpost_protocol::Direction;
    use serde_json::json;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new()
                .with_model(
                    ModelSchema::new("patients")
                        .with_attributes(["id", "name", "internal_note"])
                        .excluding(["internal_note"])
                        .with_relation("encounters", "encounters", "patient_id")
                        .with_sync_relations(RelationTree::new().with(
                            "encounters",
                            RelationTree::new().with("vitals", RelationTree::new()),
                        )),
                )
                .with_model(
                    ModelSchema::new("encounters")
                        .with_attributes(["id", "patient_id", "reason"])
                        .with_relation("vitals", "vitals", "encounter_id")
                        .with_parent_foreign_key("patient_id"),
                )
                .with_model(
                    ModelSchema::new("vitals")
                        .with_attributes(["id", "encounter_id", "pulse"])
                        .with_parent_foreign_key("encounter_id"),
                ),
        )
    }

    #[test]
    fn plan_nests_declared_relations() {
        let planner = RelationPlanner::new(registry());
        let plan = planner.build_plan("patients").unwrap();

        assert_eq!(plan.columns, vec!["id", "name"]);
        assert_eq!(plan.foreign_key, None);
        let encounters = &plan.children["encounters"];
        assert_eq!(encounters.foreign_key.as_deref(), Some("patient_id"));
        let vitals = &encounters.children["vitals"];
        assert_eq!(vitals.foreign_key.as_deref(), Some("encounter_id"));
        assert_eq!(plan.model_count(), 3);
    }

    #[test]
    fn plans_are_cached() {
        let planner = RelationPlanner::new(registry());
        let a = planner.build_plan("patients").unwrap();
        let b = planner.build_plan("patients").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unresolved_relation_fails_fast() {
        let registry = Arc::new(ModelRegistry::new().with_model(
            ModelSchema::new("patients")
                .with_sync_relations(RelationTree::new().with("encounterz", RelationTree::new())),
        ));
        let planner = RelationPlanner::new(registry);
        let err = planner.build_plan("patients").unwrap_err();
        assert!(err.is_configuration());
        assert!(planner.validate_all().is_err());
    }

    #[test]
    fn relation_to_unknown_model_fails_fast() {
        let registry = Arc::new(ModelRegistry::new().with_model(
            ModelSchema::new("patients")
                .with_relation("labs", "lab_requests", "patient_id")
                .with_sync_relations(RelationTree::new().with("labs", RelationTree::new())),
        ));
        let err = RelationPlanner::new(registry).build_plan("patients").unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedRelation { .. }));
    }

    #[test]
    fn flatten_unnests_children() {
        let planner = RelationPlanner::new(registry());
        let plan = planner.build_plan("patients").unwrap();
        let data = json!({
            "id": "p1",
            "name": "Ana",
            "encounters": [{
                "id": "e1",
                "sync_tick": 4,
                "data": {
                    "id": "e1",
                    "reason": "fever",
                    "vitals": [{"id": "v1", "sync_tick": 5, "is_deleted": true, "data": {"pulse": 80}}]
                }
            }]
        });
        let record = ChangeRecord::new(
            Direction::Incoming,
            "patients",
            "p1",
            data.as_object().cloned().unwrap(),
            SyncTick::new(6),
        );

        let flat = flatten(&plan, &record).unwrap();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0].data.get("encounters"), None);
        assert_eq!(flat[1].record_type, "encounters");
        assert_eq!(flat[1].data["patient_id"], json!("p1"));
        assert_eq!(flat[1].data.get("vitals"), None);
        assert_eq!(flat[2].record_type, "vitals");
        assert_eq!(flat[2].data["encounter_id"], json!("e1"));
        assert!(flat[2].is_deleted);
        assert_eq!(flat[2].sync_tick, SyncTick::new(5));
    }

    #[test]
    fn flatten_rejects_non_list_relation() {
        let planner = RelationPlanner::new(registry());
        let plan = planner.build_plan("patients").unwrap();
        let record = ChangeRecord::new(
            Direction::Incoming,
            "patients",
            "p1",
            json!({"encounters": "nope"}).as_object().cloned().unwrap(),
            SyncTick::new(6),
        );
        assert!(flatten(&plan, &record).is_err());
    }
}
