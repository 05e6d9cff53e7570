//! Pure diff between the stored definitions of a unit and a desired set.
//!
//! The planner never touches storage. Stores call [`plan_replace`] inside
//! their own transaction and then apply the plan, checking
//! [`deletion_guard`] for each removal against what they hold.

use std::collections::{BTreeMap, HashMap};

use armada_core::{CoreError, CoreResult, DefinitionId};

use crate::definition::{Change, DefinitionKey, DefinitionSpec, OperationDefinition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpdate {
    pub id: DefinitionId,
    pub spec: DefinitionSpec,
    /// Queued activities referencing the definition must be cancelled.
    pub cancels_pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacePlan {
    pub inserts: Vec<DefinitionSpec>,
    pub updates: Vec<PlannedUpdate>,
    pub removals: Vec<DefinitionId>,
    pub unchanged: Vec<DefinitionId>,
}

impl ReplacePlan {
    /// True when applying the plan changes nothing.
    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }

    /// Definitions whose queued activities the plan cancels.
    pub fn cancelled_definitions(&self) -> impl Iterator<Item = DefinitionId> + '_ {
        self.updates
            .iter()
            .filter(|u| u.cancels_pending)
            .map(|u| u.id)
            .chain(self.removals.iter().copied())
    }
}

/// Compute the plan that turns `current` into `desired`.
///
/// Fails with `Validation` for invalid specs or duplicate keys in `desired`.
pub fn plan_replace(
    current: &[OperationDefinition],
    desired: &[DefinitionSpec],
) -> CoreResult<ReplacePlan> {
    let mut wanted: BTreeMap<DefinitionKey, &DefinitionSpec> = BTreeMap::new();
    for spec in desired {
        spec.validate()?;
        let key = spec.key();
        if wanted.insert(key.clone(), spec).is_some() {
            return Err(CoreError::validation(format!(
                "duplicate definition key in batch: {key}"
            )));
        }
    }

    let existing: HashMap<DefinitionKey, &OperationDefinition> =
        current.iter().map(|d| (d.key(), d)).collect();

    let mut plan = ReplacePlan::default();

    for (key, spec) in &wanted {
        match existing.get(key) {
            None => plan.inserts.push((*spec).clone()),
            Some(def) => match spec.change_from(&def.spec) {
                Change::Unchanged => plan.unchanged.push(def.id),
                change => plan.updates.push(PlannedUpdate {
                    id: def.id,
                    spec: (*spec).clone(),
                    cancels_pending: change == Change::Payload,
                }),
            },
        }
    }

    for def in current {
        if !wanted.contains_key(&def.key()) {
            plan.removals.push(def.id);
        }
    }

    Ok(plan)
}

/// Check whether a definition may be removed.
///
/// `referencing_rules` is the number of automation rules pointing at it and
/// `active_activities` the number of activities currently in flight for it.
pub fn deletion_guard(
    def: &OperationDefinition,
    referencing_rules: usize,
    active_activities: usize,
) -> CoreResult<()> {
    if def.spec.required_for_provisioning {
        return Err(CoreError::precondition(format!(
            "definition '{}' is required for provisioning; remove that flag first",
            def.title()
        )));
    }
    if referencing_rules > 0 {
        return Err(CoreError::precondition(format!(
            "definition '{}' is referenced by {referencing_rules} automation rule(s)",
            def.title()
        )));
    }
    if active_activities > 0 {
        return Err(CoreError::precondition(format!(
            "definition '{}' has {active_activities} activity(ies) in flight",
            def.title()
        )));
    }
    Ok(())
}
