//! Post-snapshot hooks that rewrite staged incoming changes.
//!
//! Hooks run after a session's incoming changes are staged and before they
//! are saved to the live store. A hook only rewrites the staged batch, so
//! running it again is safe.

use crate::error::{CoreError, CoreResult};
use crate::staging::{StagedChange, StagingArea};
use outpost_protocol::{ChangeRecord, Direction, RecordKey};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What a hook sees: the staged incoming records of its model.
pub struct HookContext<'a> {
    /// Model the hook is registered for.
    pub model: &'a str,
    /// Staged incoming records of that model.
    pub records: &'a [StagedChange],
    /// The whole staging area, for looking at related models.
    pub area: &'a StagingArea,
}

/// How a hook wants the staged batch changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewriteInstruction {
    /// Records to stage as inserts or updates, replacing any staged record
    /// with the same key.
    pub upserts: Vec<ChangeRecord>,
    /// Staged records to turn into deletes.
    pub deletes: Vec<RecordKey>,
}

impl RewriteInstruction {
    /// Returns true if the instruction changes nothing.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// A per-model rewrite of staged incoming changes.
pub trait IncomingSyncHook: Send + Sync {
    /// Inspects the staged batch. Returning `None` leaves it unchanged.
    fn rewrite(&self, ctx: &HookContext<'_>) -> CoreResult<Option<RewriteInstruction>>;
}

/// Hooks keyed by model name, fixed at startup.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Arc<dyn IncomingSyncHook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("models", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`HookRegistry`].
#[derive(Default)]
pub struct HookRegistryBuilder {
    hooks: BTreeMap<String, Arc<dyn IncomingSyncHook>>,
}

impl HookRegistryBuilder {
    /// Registers the hook for `model`, replacing any earlier one.
    #[must_use]
    pub fn register(
        mut self,
        model: impl Into<String>,
        hook: impl IncomingSyncHook + 'static,
    ) -> Self {
        self.hooks.insert(model.into(), Arc::new(hook));
        self
    }

    /// Freezes the registry.
    pub fn build(self) -> HookRegistry {
        HookRegistry { hooks: self.hooks }
    }
}

impl HookRegistry {
    /// Starts building a registry.
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::default()
    }

    /// A registry with no hooks.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every hook whose model has staged incoming records.
    ///
    /// Returns the number of staged records that were changed.
    pub fn run(&self, area: &StagingArea) -> CoreResult<usize> {
        let mut changed = 0;
        for (model, hook) in &self.hooks {
            let records = area.records_for(Direction::Incoming, model)?;
            if records.is_empty() {
                continue;
            }
            let ctx = HookContext {
                model,
                records: &records,
                area,
            };
            let instruction = match hook.rewrite(&ctx) {
                Ok(Some(instruction)) if !instruction.is_empty() => instruction,
                Ok(_) => {
                    debug!(model = %model, "sync hook left batch unchanged");
                    continue;
                }
                Err(e @ CoreError::HookFailed { .. }) => return Err(e),
                Err(e) => {
                    return Err(CoreError::HookFailed {
                        model: model.clone(),
                        message: e.to_string(),
                    })
                }
            };
            let upserts = instruction.upserts.len();
            let deletes = instruction.deletes.len();
            let n = area.apply_rewrite(instruction)?;
            info!(
                session_id = area.session_id(),
                model = %model,
                upserts,
                deletes,
                changed = n,
                "sync hook rewrote staged changes"
            );
            changed += n;
        }
        Ok(changed)
    }
}

/// Deletes future child records that fall outside their parent's boundary.
///
/// Scheduling models create child records ahead of time. When an incoming
/// parent moves its boundary earlier, staged children dated after the new
/// boundary are turned into deletes. Register it for the parent model.
#[derive(Debug, Clone)]
pub struct ScheduleBoundaryHook {
    /// Model of the generated children.
    pub child_model: String,
    /// Child column referencing the parent.
    pub foreign_key: String,
    /// Child column holding the child's date.
    pub child_date_field: String,
    /// Parent column holding the last date children may fall on.
    pub parent_boundary_field: String,
}

impl ScheduleBoundaryHook {
    /// Creates a new boundary hook.
    pub fn new(
        child_model: impl Into<String>,
        foreign_key: impl Into<String>,
        child_date_field: impl Into<String>,
        parent_boundary_field: impl Into<String>,
    ) -> Self {
        Self {
            child_model: child_model.into(),
            foreign_key: foreign_key.into(),
            child_date_field: child_date_field.into(),
            parent_boundary_field: parent_boundary_field.into(),
        }
    }
}

/// Orders numbers numerically and everything else by its string form, so
/// both day offsets and ISO dates work.
fn compare_boundary(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl IncomingSyncHook for ScheduleBoundaryHook {
    fn rewrite(&self, ctx: &HookContext<'_>) -> CoreResult<Option<RewriteInstruction>> {
        let children = ctx
            .area
            .records_for(Direction::Incoming, &self.child_model)?;
        if children.is_empty() {
            return Ok(None);
        }

        let mut deletes = Vec::new();
        for parent in ctx.records.iter().map(|s| &s.change) {
            if parent.is_deleted {
                continue;
            }
            let boundary = match parent.data.get(&self.parent_boundary_field) {
                None | Some(Value::Null) => continue,
                Some(b) => b,
            };
            for child in children.iter().map(|s| &s.change) {
                if child.is_deleted {
                    continue;
                }
                let belongs = child.data.get(&self.foreign_key).and_then(Value::as_str)
                    == Some(parent.record_id.as_str());
                if !belongs {
                    continue;
                }
                let beyond = child
                    .data
                    .get(&self.child_date_field)
                    .and_then(|date| compare_boundary(date, boundary))
                    == Some(Ordering::Greater);
                if beyond {
                    deletes.push(child.key());
                }
            }
        }

        if deletes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(RewriteInstruction {
                upserts: Vec::new(),
                deletes,
            }))
        }
    }
}
