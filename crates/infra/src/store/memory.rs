//! In-memory fleet store for tests/dev.
//!
//! One `RwLock` guards the whole state, so each trait method observes and
//! mutates a consistent snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use armada_activities::{
    ActivationSelector, Activity, ActivityKind, Delivery, EnqueueOptions, ExecutionOutcome, ProvisioningStep,
    QueueState, RecordDisposition, StepStatus,
};
use armada_catalog::{
    AutomationRule, DefinitionSpec, Host, OperationDefinition, deletion_guard, plan_replace,
};
use armada_core::{CoreError, DefinitionId, ExecutionId, HostId, RuleId, StepId, UnitId, WorkflowId};

use super::{ActivityStore, CancelFilter, CatalogStore, RecordOutcome, ReplaceSummary};
use crate::error::{StoreError, StoreResult, poisoned};

#[derive(Debug, Default)]
struct FleetState {
    hosts: HashMap<HostId, Host>,
    definitions: HashMap<DefinitionId, OperationDefinition>,
    rules: HashMap<RuleId, AutomationRule>,
    activities: HashMap<ExecutionId, Activity>,
    steps: HashMap<StepId, ProvisioningStep>,
    seq: u64,
}

impl FleetState {
    fn require_host(&self, host: HostId) -> StoreResult<()> {
        if self.hosts.contains_key(&host) {
            Ok(())
        } else {
            Err(CoreError::not_found("host", host).into())
        }
    }

    fn build_activity(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Activity> {
        self.require_host(host)?;
        let def = self
            .definitions
            .get(&definition)
            .ok_or_else(|| CoreError::not_found("definition", definition))?;
        Ok(Activity::new(host, def, kind, options, self.seq + 1, now)?)
    }

    fn insert_activity(&mut self, activity: Activity) {
        self.seq = self.seq.max(activity.seq);
        self.activities.insert(activity.execution_id, activity);
    }

    fn has_active(&self, host: HostId) -> bool {
        self.activities
            .values()
            .any(|a| a.host == host && a.state == QueueState::Active)
    }

    fn has_pending_for(&self, host: HostId, definition: DefinitionId) -> bool {
        self.activities
            .values()
            .any(|a| a.host == host && a.definition_id == definition && a.is_pending())
    }

    fn sync_steps(&mut self, activity: &Activity, now: DateTime<Utc>) {
        for step in self
            .steps
            .values_mut()
            .filter(|s| s.execution_id == activity.execution_id)
        {
            step.sync(activity, now);
        }
    }

    fn activate_next(
        &mut self,
        host: HostId,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        self.require_host(host)?;
        if self.has_active(host) {
            return Ok(None);
        }

        let mut queued: Vec<Activity> = self
            .activities
            .values()
            .filter(|a| a.host == host && a.state == QueueState::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|a| a.queue_key());

        let Some(pick) = selector.select(host, &queued) else {
            return Ok(None);
        };

        let def = self
            .definitions
            .get(&pick.definition_id)
            .ok_or_else(|| CoreError::not_found("definition", pick.definition_id))?;
        let delivery = Delivery::materialize(pick.kind, &def.spec.payload, host, pick.execution_id)?;

        let activity = self
            .activities
            .get_mut(&pick.execution_id)
            .ok_or_else(|| CoreError::not_found("activity", pick.execution_id))?;
        activity.activate(delivery, now)?;
        let activated = activity.clone();
        self.sync_steps(&activated, now);
        Ok(Some(activated))
    }

    fn cancel_where(&mut self, filter: &CancelFilter, now: DateTime<Utc>) -> Vec<ExecutionId> {
        let mut cancelled = Vec::new();
        for activity in self.activities.values_mut() {
            if activity.state == QueueState::Queued && filter.matches(activity) && activity.cancel(now).is_ok() {
                cancelled.push(activity.execution_id);
            }
        }
        for step in self.steps.values_mut() {
            if cancelled.contains(&step.execution_id) {
                step.status = StepStatus::Cancelled;
                step.updated_at = now;
            }
        }
        cancelled.sort();
        cancelled
    }

    fn removal_guard(&self, def: &OperationDefinition) -> StoreResult<()> {
        let rules = self.rules.values().filter(|r| r.definition_id == def.id).count();
        let active = self
            .activities
            .values()
            .filter(|a| a.definition_id == def.id && a.state == QueueState::Active)
            .count();
        Ok(deletion_guard(def, rules, active)?)
    }
}

/// In-memory catalog + activity store.
#[derive(Debug, Default)]
pub struct InMemoryFleetStore {
    state: RwLock<FleetState>,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, FleetState>> {
        self.state.read().map_err(poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, FleetState>> {
        self.state.write().map_err(poisoned)
    }
}

impl CatalogStore for InMemoryFleetStore {
    fn upsert_host(&self, host: Host) -> StoreResult<()> {
        self.write()?.hosts.insert(host.id, host);
        Ok(())
    }

    fn host(&self, id: HostId) -> StoreResult<Option<Host>> {
        Ok(self.read()?.hosts.get(&id).cloned())
    }

    fn insert_definition(
        &self,
        unit: UnitId,
        spec: DefinitionSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<OperationDefinition> {
        spec.validate()?;
        let mut state = self.write()?;
        let key = spec.key();
        if state
            .definitions
            .values()
            .any(|d| d.unit == unit && d.key() == key)
        {
            return Err(StoreError::Conflict(format!("definition key already in use: {key}")));
        }
        let def = OperationDefinition::new(unit, spec, now);
        state.definitions.insert(def.id, def.clone());
        Ok(def)
    }

    fn definition(&self, id: DefinitionId) -> StoreResult<Option<OperationDefinition>> {
        Ok(self.read()?.definitions.get(&id).cloned())
    }

    fn definitions(&self, unit: UnitId) -> StoreResult<Vec<OperationDefinition>> {
        let state = self.read()?;
        let mut defs: Vec<_> = state
            .definitions
            .values()
            .filter(|d| d.unit == unit)
            .cloned()
            .collect();
        defs.sort_by_key(|d| (d.created_at, d.id));
        Ok(defs)
    }

    fn replace_definitions(
        &self,
        unit: UnitId,
        desired: &[DefinitionSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<ReplaceSummary> {
        let mut state = self.write()?;

        let current: Vec<OperationDefinition> = state
            .definitions
            .values()
            .filter(|d| d.unit == unit)
            .cloned()
            .collect();
        let plan = plan_replace(&current, desired)?;

        for id in &plan.removals {
            if let Some(def) = state.definitions.get(id) {
                state.removal_guard(def)?;
            }
        }

        // Every check passed; nothing below can fail.
        let mut summary = ReplaceSummary {
            unchanged: plan.unchanged.len(),
            ..ReplaceSummary::default()
        };

        let stale: Vec<DefinitionId> = plan.cancelled_definitions().collect();
        for id in stale {
            let cancelled = state.cancel_where(&CancelFilter::Definition(id), now);
            summary.cancelled.extend(cancelled);
        }

        for spec in plan.inserts {
            let def = OperationDefinition::new(unit, spec, now);
            summary.inserted.push(def.id);
            state.definitions.insert(def.id, def);
        }

        for update in plan.updates {
            if let Some(def) = state.definitions.get_mut(&update.id) {
                def.replace_spec(update.spec, now);
                summary.updated.push(update.id);
            }
        }

        for id in plan.removals {
            state.definitions.remove(&id);
            summary.removed.push(id);
        }

        Ok(summary)
    }

    fn delete_definition(&self, id: DefinitionId, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        let mut state = self.write()?;
        let def = state
            .definitions
            .get(&id)
            .ok_or_else(|| CoreError::not_found("definition", id))?;
        state.removal_guard(def)?;

        let cancelled = state.cancel_where(&CancelFilter::Definition(id), now);
        state.definitions.remove(&id);
        Ok(cancelled)
    }

    fn upsert_rule(&self, rule: AutomationRule) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.definitions.contains_key(&rule.definition_id) {
            return Err(CoreError::not_found("definition", rule.definition_id).into());
        }
        state.rules.insert(rule.id, rule);
        Ok(())
    }

    fn rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
        Ok(self.read()?.rules.get(&id).cloned())
    }

    fn delete_rule(&self, id: RuleId) -> StoreResult<()> {
        match self.write()?.rules.remove(&id) {
            Some(_) => Ok(()),
            None => Err(CoreError::not_found("automation rule", id).into()),
        }
    }
}

impl ActivityStore for InMemoryFleetStore {
    fn enqueue(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Activity> {
        let mut state = self.write()?;
        let activity = state.build_activity(host, definition, kind, options, now)?;
        state.insert_activity(activity.clone());
        Ok(activity)
    }

    fn enqueue_if_idle(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        let mut state = self.write()?;
        let activity = state.build_activity(host, definition, kind, options, now)?;
        if state.has_pending_for(host, definition) {
            return Ok(None);
        }
        state.insert_activity(activity.clone());
        Ok(Some(activity))
    }

    fn activate_next(
        &self,
        host: HostId,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        self.write()?.activate_next(host, selector, now)
    }

    fn record_result(
        &self,
        host: HostId,
        execution_id: ExecutionId,
        outcome: ExecutionOutcome,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<RecordOutcome> {
        let mut state = self.write()?;

        let activity = state
            .activities
            .get_mut(&execution_id)
            .filter(|a| a.host == host)
            .ok_or_else(|| CoreError::not_found("activity", execution_id))?;
        let before = activity.clone();
        let disposition = activity.record(outcome, now)?;
        let recorded = activity.clone();

        match disposition {
            RecordDisposition::AlreadyCompleted(status) => Ok(RecordOutcome::AlreadyCompleted { status }),
            RecordDisposition::InProgress(status) => Ok(RecordOutcome::InProgress { status }),
            RecordDisposition::Completed(status) => {
                let steps_before: Vec<ProvisioningStep> = state
                    .steps
                    .values()
                    .filter(|s| s.execution_id == execution_id)
                    .cloned()
                    .collect();
                state.sync_steps(&recorded, now);

                match state.activate_next(host, selector, now) {
                    Ok(next) => Ok(RecordOutcome::Completed { status, next }),
                    Err(err) => {
                        state.activities.insert(execution_id, before);
                        for step in steps_before {
                            state.steps.insert(step.id, step);
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    fn cancel(&self, filter: &CancelFilter, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        Ok(self.write()?.cancel_where(filter, now))
    }

    fn list_pending(&self, host: HostId) -> StoreResult<Vec<Activity>> {
        let state = self.read()?;
        let mut pending: Vec<Activity> = state
            .activities
            .values()
            .filter(|a| a.host == host && a.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|a| (a.state != QueueState::Active, a.queue_key()));
        Ok(pending)
    }

    fn activity(&self, execution_id: ExecutionId) -> StoreResult<Option<Activity>> {
        Ok(self.read()?.activities.get(&execution_id).cloned())
    }

    fn activities_for_definition(&self, definition: DefinitionId) -> StoreResult<Vec<Activity>> {
        let state = self.read()?;
        let mut activities: Vec<Activity> = state
            .activities
            .values()
            .filter(|a| a.definition_id == definition)
            .cloned()
            .collect();
        activities.sort_by_key(|a| a.queue_key());
        Ok(activities)
    }

    fn enqueue_step(
        &self,
        workflow_id: WorkflowId,
        host: HostId,
        definition: DefinitionId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Activity, ProvisioningStep)> {
        let mut state = self.write()?;
        let activity = state.build_activity(
            host,
            definition,
            ActivityKind::Install,
            EnqueueOptions::provisioning(workflow_id),
            now,
        )?;
        let step = ProvisioningStep::for_activity(workflow_id, &activity, now);
        state.insert_activity(activity.clone());
        state.steps.insert(step.id, step.clone());
        Ok((activity, step))
    }

    fn steps(&self, workflow_id: WorkflowId) -> StoreResult<Vec<ProvisioningStep>> {
        let state = self.read()?;
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.id);
        Ok(steps)
    }

    fn retarget_step(&self, step_id: StepId, now: DateTime<Utc>) -> StoreResult<ProvisioningStep> {
        let mut state = self.write()?;
        let mut step = state
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("provisioning step", step_id))?;
        let activity = state.build_activity(
            step.host,
            step.definition_id,
            ActivityKind::Install,
            EnqueueOptions::provisioning(step.workflow_id),
            now,
        )?;
        step.retarget(&activity, now)?;
        state.insert_activity(activity);
        state.steps.insert(step.id, step.clone());
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_activities::FifoSelector;
    use armada_catalog::Payload;

    fn seeded() -> (InMemoryFleetStore, HostId, OperationDefinition) {
        let store = InMemoryFleetStore::new();
        let host = Host::new(UnitId::global(), "mac-01");
        let host_id = host.id;
        store.upsert_host(host).unwrap();
        let def = store
            .insert_definition(
                UnitId::global(),
                DefinitionSpec::new("app", "apps", Payload::package("app", "i.sh", "u.sh")),
                Utc::now(),
            )
            .unwrap();
        (store, host_id, def)
    }

    #[test]
    fn enqueue_unknown_host_is_not_found() {
        let (store, _, def) = seeded();
        let err = store
            .enqueue(HostId::new(), def.id, ActivityKind::Install, EnqueueOptions::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(CoreError::NotFound { entity: "host", .. })));
    }

    #[test]
    fn enqueue_unknown_definition_is_not_found() {
        let (store, host, _) = seeded();
        let err = store
            .enqueue(host, DefinitionId::new(), ActivityKind::Install, EnqueueOptions::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(CoreError::NotFound { entity: "definition", .. })));
    }

    #[test]
    fn sequence_numbers_increase() {
        let (store, host, def) = seeded();
        let now = Utc::now();
        let a = store.enqueue(host, def.id, ActivityKind::Install, EnqueueOptions::default(), now).unwrap();
        let b = store.enqueue(host, def.id, ActivityKind::Uninstall, EnqueueOptions::default(), now).unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn duplicate_definition_key_conflicts() {
        let (store, _, _) = seeded();
        let err = store
            .insert_definition(
                UnitId::global(),
                DefinitionSpec::new("app", "apps", Payload::package("app", "i.sh", "u.sh")),
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn failed_replace_changes_nothing() {
        let (store, host, def) = seeded();
        let mut required = def.spec.clone();
        required.required_for_provisioning = true;
        store.replace_definitions(UnitId::global(), &[required], Utc::now()).unwrap();

        let queued = store
            .enqueue(host, def.id, ActivityKind::Install, EnqueueOptions::default(), Utc::now())
            .unwrap();

        // Removing the required definition while inserting another must fail as a whole.
        let other = DefinitionSpec::new("other", "apps", Payload::script("echo"));
        let err = store.replace_definitions(UnitId::global(), &[other], Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Domain(CoreError::PreconditionFailed(_))));

        assert_eq!(store.definitions(UnitId::global()).unwrap().len(), 1);
        let still = store.activity(queued.execution_id).unwrap().unwrap();
        assert_eq!(still.state, QueueState::Queued);
    }

    #[test]
    fn enqueue_if_idle_skips_pending_pairs() {
        let (store, host, def) = seeded();
        let first = store
            .enqueue_if_idle(host, def.id, ActivityKind::Install, EnqueueOptions::default(), Utc::now())
            .unwrap();
        assert!(first.is_some());
        let second = store
            .enqueue_if_idle(host, def.id, ActivityKind::Install, EnqueueOptions::default(), Utc::now())
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn activation_marks_step_running() {
        let (store, host, def) = seeded();
        let workflow = WorkflowId::new();
        let (_, step) = store.enqueue_step(workflow, host, def.id, Utc::now()).unwrap();
        assert_eq!(step.status, StepStatus::Pending);

        store.activate_next(host, &FifoSelector, Utc::now()).unwrap().unwrap();
        let steps = store.steps(workflow).unwrap();
        assert_eq!(steps[0].status, StepStatus::Running);
    }

    #[test]
    fn rule_requires_existing_definition() {
        let (store, _, _) = seeded();
        let rule = AutomationRule::new(UnitId::global(), "missing", DefinitionId::new());
        assert!(store.upsert_rule(rule).is_err());
    }
}
