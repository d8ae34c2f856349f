//! Model schemas supplied by the consuming application.

use crate::error::{CoreError, CoreResult};
use outpost_protocol::FIELD_TICKS_KEY;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Which way a model's records replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    /// Pushed by facilities and pulled from central.
    Bidirectional,
    /// Only pushed from facilities to central.
    PushToCentral,
    /// Only pulled from central to facilities.
    PullFromCentral,
    /// Never synced.
    DoNotSync,
}

impl SyncDirection {
    /// Returns true if facilities push this model.
    pub fn pushes(&self) -> bool {
        matches!(self, SyncDirection::Bidirectional | SyncDirection::PushToCentral)
    }

    /// Returns true if facilities pull this model.
    pub fn pulls(&self) -> bool {
        matches!(
            self,
            SyncDirection::Bidirectional | SyncDirection::PullFromCentral
        )
    }
}

/// A relation from one model to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    /// Target model name.
    pub target: String,
    /// Column on the target model that references the owning record.
    pub foreign_key: String,
}

/// Nested map of relation names to include when exporting a model.
///
/// `patient → encounters → vitals` is written as
/// `RelationTree::new().with("encounters", RelationTree::new().with("vitals", RelationTree::new()))`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationTree(BTreeMap<String, RelationTree>);

impl RelationTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child relation.
    #[must_use]
    pub fn with(mut self, relation: impl Into<String>, subtree: RelationTree) -> Self {
        self.0.insert(relation.into(), subtree);
        self
    }

    /// Iterates over the child relations.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RelationTree)> {
        self.0.iter()
    }

    /// Returns true if the tree has no relations.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything the sync engine needs to know about a model.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    /// Model (table) name.
    pub name: String,
    /// All attributes of the model.
    pub attributes: Vec<String>,
    /// Attributes that are never replicated.
    pub excluded: BTreeSet<String>,
    /// Relations of the model by name.
    pub relations: BTreeMap<String, RelationDef>,
    /// Relations to nest when exporting.
    pub sync_relations: RelationTree,
    /// Foreign key to the parent, for models that only travel nested.
    pub parent_foreign_key: Option<String>,
    /// Replication direction.
    pub direction: SyncDirection,
    /// Whether records carry per-field tick metadata.
    pub field_ticks: bool,
}

impl ModelSchema {
    /// Creates a bidirectional model with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            excluded: BTreeSet::new(),
            relations: BTreeMap::new(),
            sync_relations: RelationTree::new(),
            parent_foreign_key: None,
            direction: SyncDirection::Bidirectional,
            field_ticks: false,
        }
    }

    /// Sets the attribute list.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Excludes attributes from replication.
    #[must_use]
    pub fn excluding<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Declares a relation.
    #[must_use]
    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relations.insert(
            name.into(),
            RelationDef {
                target: target.into(),
                foreign_key: foreign_key.into(),
            },
        );
        self
    }

    /// Declares which relations are nested on export.
    #[must_use]
    pub fn with_sync_relations(mut self, tree: RelationTree) -> Self {
        self.sync_relations = tree;
        self
    }

    /// Marks the model as only travelling nested under a parent.
    #[must_use]
    pub fn with_parent_foreign_key(mut self, foreign_key: impl Into<String>) -> Self {
        self.parent_foreign_key = Some(foreign_key.into());
        self
    }

    /// Sets the replication direction.
    #[must_use]
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Enables per-field tick metadata.
    #[must_use]
    pub fn with_field_ticks(mut self) -> Self {
        self.field_ticks = true;
        self
    }

    /// Attributes that travel over the wire.
    ///
    /// Models with per-field ticks always carry their tick column.
    pub fn synced_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .attributes
            .iter()
            .filter(|a| !self.excluded.contains(*a))
            .cloned()
            .collect();
        if self.field_ticks && !columns.iter().any(|c| c == FIELD_TICKS_KEY) {
            columns.push(FIELD_TICKS_KEY.to_string());
        }
        columns
    }

    /// Returns true if records of this model are exported on their own
    /// rather than nested under a parent.
    pub fn is_standalone(&self) -> bool {
        self.parent_foreign_key.is_none()
    }
}

/// The set of syncable models, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelSchema>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model, replacing any model of the same name.
    #[must_use]
    pub fn with_model(mut self, schema: ModelSchema) -> Self {
        self.register(schema);
        self
    }

    /// Registers a model, replacing any model of the same name.
    pub fn register(&mut self, schema: ModelSchema) {
        self.models.insert(schema.name.clone(), Arc::new(schema));
    }

    /// Looks up a model.
    pub fn get(&self, name: &str) -> CoreResult<&Arc<ModelSchema>> {
        self.models.get(name).ok_or_else(|| CoreError::UnknownModel {
            model: name.to_string(),
        })
    }

    /// Models facilities push.
    pub fn for_push(&self) -> Vec<Arc<ModelSchema>> {
        self.models
            .values()
            .filter(|m| m.direction.pushes())
            .cloned()
            .collect()
    }

    /// Models facilities pull.
    pub fn for_pull(&self) -> Vec<Arc<ModelSchema>> {
        self.models
            .values()
            .filter(|m| m.direction.pulls())
            .cloned()
            .collect()
    }

    /// Iterates over all models.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSchema>> {
        self.models.values()
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no models are registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synced_columns_drop_exclusions() {
        let schema = ModelSchema::new("patients")
            .with_attributes(["id", "name", "merged_into", "updated_at"])
            .excluding(["merged_into"]);
        assert_eq!(schema.synced_columns(), vec!["id", "name", "updated_at"]);

        let with_ticks = schema.with_field_ticks();
        assert_eq!(with_ticks.synced_columns().last().unwrap(), FIELD_TICKS_KEY);
    }

    #[test]
    fn directions() {
        assert!(SyncDirection::Bidirectional.pushes());
        assert!(SyncDirection::Bidirectional.pulls());
        assert!(SyncDirection::PushToCentral.pushes());
        assert!(!SyncDirection::PushToCentral.pulls());
        assert!(!SyncDirection::PullFromCentral.pushes());
        assert!(!SyncDirection::DoNotSync.pulls());
    }

    #[test]
    fn registry_filters_by_direction() {
        let registry = ModelRegistry::new()
            .with_model(ModelSchema::new("patients"))
            .with_model(ModelSchema::new("reference_data").with_direction(SyncDirection::PullFromCentral))
            .with_model(ModelSchema::new("sessions").with_direction(SyncDirection::DoNotSync));

        let push: Vec<_> = registry.for_push().iter().map(|m| m.name.clone()).collect();
        let pull: Vec<_> = registry.for_pull().iter().map(|m| m.name.clone()).collect();
        assert_eq!(push, vec!["patients"]);
        assert_eq!(pull, vec!["patients", "reference_data"]);
        assert!(matches!(
            registry.get("labs"),
            Err(CoreError::UnknownModel { .. })
        ));
    }
}
