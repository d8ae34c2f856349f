//! Test fixtures: a small clinical schema and helpers to stand up central and
//! facility nodes around it.

use crate::loopback::LoopbackTransport;
use outpost_core::{
    LiveStore, ModelRegistry, ModelSchema, RelationPlanner, RelationTree, SyncDirection,
    TickClock, TickStamp,
};
use outpost_protocol::{RecordData, SyncTick, FIELD_TICKS_KEY};
use outpost_sync_engine::{FacilitySyncEngine, LimiterConfig, RetryConfig, SyncConfig};
use outpost_sync_server::{ServerConfig, SyncServer};
use serde_json::Value;
use std::sync::Arc;

/// The clinical registry used across tests.
///
/// - `patients` carry per-field ticks, keep `internal_notes` local and nest
///   their `encounters`, which nest their `vitals`
/// - `appointment_schedules` and `appointments` travel on their own
/// - `facility_settings` only flow from central
pub fn clinic_registry() -> ModelRegistry {
    ModelRegistry::new()
        .with_model(
            ModelSchema::new("patients")
                .with_attributes(["id", "name", "phone", "village", "internal_notes"])
                .excluding(["internal_notes"])
                .with_relation("encounters", "encounters", "patient_id")
                .with_sync_relations(RelationTree::new().with(
                    "encounters",
                    RelationTree::new().with("vitals", RelationTree::new()),
                ))
                .with_field_ticks(),
        )
        .with_model(
            ModelSchema::new("encounters")
                .with_attributes(["id", "patient_id", "reason"])
                .with_relation("vitals", "vitals", "encounter_id")
                .with_parent_foreign_key("patient_id"),
        )
        .with_model(
            ModelSchema::new("vitals")
                .with_attributes(["id", "encounter_id", "temperature"])
                .with_parent_foreign_key("encounter_id"),
        )
        .with_model(
            ModelSchema::new("appointment_schedules").with_attributes(["id", "until_day"]),
        )
        .with_model(
            ModelSchema::new("appointments").with_attributes(["id", "schedule_id", "day"]),
        )
        .with_model(
            ModelSchema::new("facility_settings")
                .with_attributes(["id", "value"])
                .with_direction(SyncDirection::PullFromCentral),
        )
}

/// A planner over [`clinic_registry`].
pub fn clinic_planner() -> Arc<RelationPlanner> {
    Arc::new(RelationPlanner::new(Arc::new(clinic_registry())))
}

/// Converts a JSON object literal into record data.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn record(value: Value) -> RecordData {
    match value {
        Value::Object(map) => map,
        other => panic!("record data must be a JSON object, got {other}"),
    }
}

/// Writes a record in its own transaction, stamped with the current tick.
pub fn write(store: &LiveStore, model: &str, id: &str, value: Value) -> SyncTick {
    store
        .write(|tx| Ok(tx.put(model, id, record(value), false, TickStamp::Current)))
        .expect("write failed")
}

/// Writes a record whose fields all start with per-field tick zero.
pub fn write_with_field_ticks(store: &LiveStore, model: &str, id: &str, value: Value) -> SyncTick {
    let mut data = record(value);
    let ticks: serde_json::Map<String, Value> = data.keys().map(|k| (k.clone(), Value::from(0))).collect();
    data.insert(FIELD_TICKS_KEY.to_string(), Value::Object(ticks));
    store
        .write(|tx| Ok(tx.put(model, id, data, false, TickStamp::Current)))
        .expect("write failed")
}

/// Applies a local field edit, stamping per-field ticks.
pub fn edit(store: &LiveStore, model: &str, id: &str, value: Value) -> SyncTick {
    store
        .write(|tx| Ok(tx.update_fields(model, id, record(value))))
        .expect("edit failed")
}

/// Soft deletes a record.
pub fn delete(store: &LiveStore, model: &str, id: &str) -> bool {
    store.write(|tx| Ok(tx.delete(model, id))).expect("delete failed")
}

/// Reads one column of a live record.
pub fn field(store: &LiveStore, model: &str, id: &str, column: &str) -> Option<Value> {
    store.get(model, id)?.data.get(column).cloned()
}

/// Central server over its own live store.
#[derive(Debug, Clone)]
pub struct TestCentral {
    /// The server facilities talk to.
    pub server: Arc<SyncServer>,
}

impl TestCentral {
    /// Central with default limits and the clinical schema.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Central with the given limits and the clinical schema.
    pub fn with_config(config: ServerConfig) -> Self {
        let store = Arc::new(LiveStore::new(Arc::new(TickClock::default())));
        Self {
            server: Arc::new(SyncServer::new(config, store, clinic_planner())),
        }
    }

    /// Central's live store.
    pub fn store(&self) -> &Arc<LiveStore> {
        self.server.manager().store()
    }

    /// A facility with small pages so multi-page transfers are common.
    pub fn facility(&self, facility_id: &str) -> TestFacility {
        let config = SyncConfig::new(facility_id, format!("{facility_id}-device"))
            .with_limiter(LimiterConfig::new(10, 1, 100))
            .with_retry(RetryConfig::no_retry());
        self.facility_with(config)
    }

    /// A facility with the given sync configuration.
    pub fn facility_with(&self, config: SyncConfig) -> TestFacility {
        let transport = LoopbackTransport::new(Arc::clone(&self.server));
        let store = Arc::new(LiveStore::new(Arc::new(TickClock::default())));
        TestFacility {
            engine: FacilitySyncEngine::new(config, transport, store, clinic_planner()),
        }
    }
}

impl Default for TestCentral {
    fn default() -> Self {
        Self::new()
    }
}

/// One facility node.
pub struct TestFacility {
    /// The facility's sync engine.
    pub engine: FacilitySyncEngine<LoopbackTransport>,
}

impl TestFacility {
    /// The facility's live store.
    pub fn store(&self) -> &Arc<LiveStore> {
        self.engine.store()
    }

    /// The facility's transport.
    pub fn transport(&self) -> &LoopbackTransport {
        self.engine.transport()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_is_consistent() {
        let planner = clinic_planner();
        planner.validate_all().unwrap();
        let plan = planner.build_plan("patients").unwrap();
        assert_eq!(plan.model_count(), 3);
    }

    #[test]
    fn field_tick_writes() {
        let store = LiveStore::new(Arc::new(TickClock::new(SyncTick::new(5))));
        write_with_field_ticks(&store, "patients", "p1", json!({"name": "Ana", "phone": "1"}));
        edit(&store, "patients", "p1", json!({"phone": "2"}));

        let patient = store.get("patients", "p1").unwrap();
        assert_eq!(patient.data[FIELD_TICKS_KEY], json!({"name": 0, "phone": 5}));
        assert_eq!(field(&store, "patients", "p1", "phone"), Some(json!("2")));
    }
}
