//! Batch reconciliation of a unit's definition catalog.

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use armada_catalog::DefinitionSpec;
use armada_core::{CoreResult, DefinitionId, ExecutionId, UnitId};

use crate::store::{FleetStore, ReplaceSummary};

/// Applies desired definition sets and guarded deletions.
///
/// Diffing, removal guards, definition writes and cancellation of stale
/// queued activities happen in one store call, so a failed batch leaves
/// nothing behind.
pub struct BatchReconciler<S: FleetStore> {
    store: S,
}

impl<S: FleetStore> BatchReconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Make `desired` the full definition set of `unit`.
    #[instrument(skip(self, desired), fields(unit_id = %unit, desired = desired.len()))]
    pub fn replace(&self, unit: UnitId, desired: &[DefinitionSpec], now: DateTime<Utc>) -> CoreResult<ReplaceSummary> {
        let summary = self.store.replace_definitions(unit, desired, now)?;
        info!(
            inserted = summary.inserted.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            unchanged = summary.unchanged,
            cancelled = summary.cancelled.len(),
            "definitions reconciled"
        );
        Ok(summary)
    }

    /// Delete one definition and cancel its queued activities.
    #[instrument(skip(self), fields(definition_id = %id))]
    pub fn delete(&self, id: DefinitionId, now: DateTime<Utc>) -> CoreResult<Vec<ExecutionId>> {
        let cancelled = self.store.delete_definition(id, now)?;
        info!(cancelled = cancelled.len(), "definition deleted");
        Ok(cancelled)
    }
}
