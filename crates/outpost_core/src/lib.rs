//! # Outpost Core
//!
//! Engine primitives for replicating many offline facility stores with one
//! central store.
//!
//! This crate provides:
//! - The logical sync clock with advisory locks ([`TickClock`])
//! - Model schemas and the relation planner ([`RelationPlanner`])
//! - Whole-record and per-field reconciliation ([`merge`])
//! - Per-session staging areas ([`SnapshotSessionStore`])
//! - Post-snapshot rewrite hooks ([`HookRegistry`])
//! - A transactional live store and change saving
//! - The sync session audit log ([`SessionLog`])
//!
//! ## Key Invariants
//!
//! - The current tick only increases
//! - A transaction holds an advisory lock on its tick until it ends
//! - Within an export, records are ordered by tick then key
//! - A staging area belongs to exactly one session
//! - Re-merging an already merged record changes nothing

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod error;
mod export;
mod hooks;
mod model;
mod planner;
mod reconcile;
mod save;
mod session;
mod staging;
mod store;

pub use clock::{AdvisoryLock, TickClock, TickStamp};
pub use error::{CoreError, CoreResult};
pub use export::{collect_outgoing_changes, ExportWindow};
pub use hooks::{
    HookContext, HookRegistry, HookRegistryBuilder, IncomingSyncHook, RewriteInstruction,
    ScheduleBoundaryHook,
};
pub use model::{ModelRegistry, ModelSchema, RelationDef, RelationTree, SyncDirection};
pub use planner::{flatten, NestedRecord, RelationPlanner, SyncPlan};
pub use reconcile::{
    merge, merge_for_model, merge_outcome, merge_policy, MergeOutcome, MergePolicy, MergeSource,
    VersionedRecord,
};
pub use save::{save_changes_for_model, SaveStats, StampPolicy};
pub use session::{SessionLog, SyncSession};
pub use staging::{validate_session_id, SnapshotSessionStore, StagedChange, StagingArea};
pub use store::{LiveRecord, LiveStore, StoreTransaction};

/// Names of node-local facts kept in the live store.
pub mod facts {
    /// Tick up to which local changes have been pushed.
    pub const LAST_SUCCESSFUL_PUSH: &str = "last_successful_sync_push";
    /// Tick up to which central changes have been pulled.
    pub const LAST_SUCCESSFUL_PULL: &str = "last_successful_sync_pull";
}
