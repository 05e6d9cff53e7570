//! Host activity queue service.
//!
//! `ActivityQueue` is what transport adapters and API handlers talk to. It
//! composes an [`ActivityStore`] with an injectable [`ActivationSelector`]
//! and maps storage errors into the core taxonomy.
//!
//! ## Activation flow
//!
//! ```text
//! enqueue ──► Queued ──activate_next──► Active ──record_result──► Completed
//!               │                                   │
//!               └── cancel ──► Cancelled            └── activate_next (same step)
//! ```
//!
//! ## Error semantics
//!
//! - `NotFound` / `PreconditionFailed` / `Validation`: returned to the caller
//! - `Conflict` from activation: a concurrent writer won; retried here up to
//!   [`MAX_ACTIVATION_ATTEMPTS`] and logged at `debug`
//! - storage failures: `Transient`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use armada_activities::{
    ActivationSelector, Activity, ActivityKind, AggregateStatus, EnqueueOptions, ExecutionOutcome, FifoSelector,
};
use armada_core::{CoreError, CoreResult, DefinitionId, ExecutionId, HostId, RuleId};

use crate::store::{CancelFilter, FleetStore, RecordOutcome};

/// Activation attempts before a persistent `Conflict` is surfaced.
pub const MAX_ACTIVATION_ATTEMPTS: usize = 3;

pub struct ActivityQueue<S: FleetStore> {
    store: S,
    selector: Arc<dyn ActivationSelector>,
}

impl<S: FleetStore> ActivityQueue<S> {
    /// Queue with oldest-first activation.
    pub fn new(store: S) -> Self {
        Self::with_selector(store, Arc::new(FifoSelector))
    }

    pub fn with_selector(store: S, selector: Arc<dyn ActivationSelector>) -> Self {
        Self { store, selector }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a queued activity; activation is a separate step.
    #[instrument(skip(self, options), fields(host_id = %host, definition_id = %definition, kind = %kind))]
    pub fn enqueue(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> CoreResult<ExecutionId> {
        let activity = self.store.enqueue(host, definition, kind, options, now)?;
        debug!(execution_id = %activity.execution_id, "activity queued");
        Ok(activity.execution_id)
    }

    /// Activate the next queued activity for `host`.
    ///
    /// Returns `None` when the host has nothing queued or already has an
    /// activity in flight.
    pub fn activate_next(&self, host: HostId, now: DateTime<Utc>) -> CoreResult<Option<Activity>> {
        let mut attempt = 1;
        loop {
            match self.store.activate_next(host, self.selector.as_ref(), now) {
                Ok(activated) => {
                    if let Some(a) = &activated {
                        info!(host_id = %host, execution_id = %a.execution_id, kind = %a.kind, "activity activated");
                    }
                    return Ok(activated);
                }
                Err(e) if e.is_conflict() && attempt < MAX_ACTIVATION_ATTEMPTS => {
                    debug!(host_id = %host, attempt, error = %e, "activation race lost, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record a transport report for the host's active activity.
    ///
    /// A terminal report completes the activity and activates the next one in
    /// the same atomic step; a duplicate report is `AlreadyCompleted`.
    #[instrument(skip(self, outcome), fields(host_id = %host, execution_id = %execution_id))]
    pub fn record_result(
        &self,
        host: HostId,
        execution_id: ExecutionId,
        outcome: ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> CoreResult<RecordOutcome> {
        let mut attempt = 1;
        let recorded = loop {
            match self
                .store
                .record_result(host, execution_id, outcome.clone(), self.selector.as_ref(), now)
            {
                Ok(recorded) => break recorded,
                Err(e) if e.is_conflict() && attempt < MAX_ACTIVATION_ATTEMPTS => {
                    debug!(attempt, error = %e, "activation race lost while advancing, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        match &recorded {
            RecordOutcome::Completed { status, next } => {
                info!(
                    status = ?status,
                    next = ?next.as_ref().map(|a| a.execution_id),
                    "activity completed"
                );
            }
            RecordOutcome::InProgress { status } => debug!(status = ?status, "partial result stored"),
            RecordOutcome::AlreadyCompleted { status } => {
                debug!(status = ?status, "duplicate result ignored")
            }
        }
        Ok(recorded)
    }

    /// Cancel queued activities. Active and completed ones are untouched.
    pub fn cancel(&self, filter: &CancelFilter, now: DateTime<Utc>) -> CoreResult<usize> {
        let cancelled = self.store.cancel(filter, now)?;
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), filter = ?filter, "activities cancelled");
        }
        Ok(cancelled.len())
    }

    pub fn list_pending(&self, host: HostId) -> CoreResult<Vec<Activity>> {
        Ok(self.store.list_pending(host)?)
    }

    /// The activity with its status and result, also after its definition is gone.
    pub fn get_result(&self, execution_id: ExecutionId) -> CoreResult<Activity> {
        self.store
            .activity(execution_id)?
            .ok_or_else(|| CoreError::not_found("activity", execution_id))
    }

    pub fn aggregate_status(&self, definition: DefinitionId) -> CoreResult<AggregateStatus> {
        if self.store.definition(definition)?.is_none() {
            return Err(CoreError::not_found("definition", definition));
        }
        let activities = self.store.activities_for_definition(definition)?;
        Ok(AggregateStatus::from_activities(&activities))
    }

    /// Enqueue the rule's install on every host in its audience that has
    /// nothing queued or active for the definition.
    #[instrument(skip(self, hosts), fields(rule_id = %rule_id))]
    pub fn enqueue_for_rule(&self, rule_id: RuleId, hosts: &[HostId], now: DateTime<Utc>) -> CoreResult<Vec<ExecutionId>> {
        let rule = self
            .store
            .rule(rule_id)?
            .ok_or_else(|| CoreError::not_found("automation rule", rule_id))?;
        let definition = self
            .store
            .definition(rule.definition_id)?
            .ok_or_else(|| CoreError::not_found("definition", rule.definition_id))?;

        let mut queued = Vec::new();
        for &host_id in hosts {
            let host = self
                .store
                .host(host_id)?
                .ok_or_else(|| CoreError::not_found("host", host_id))?;
            if !definition.spec.audience.matches(&host.labels) {
                continue;
            }
            if let Some(activity) = self.store.enqueue_if_idle(
                host_id,
                definition.id,
                ActivityKind::Install,
                EnqueueOptions::automation(rule_id),
                now,
            )? {
                queued.push(activity.execution_id);
            }
        }

        info!(candidates = hosts.len(), queued = queued.len(), "automation rule evaluated");
        Ok(queued)
    }

    pub fn cancel_for_rule(&self, rule_id: RuleId, now: DateTime<Utc>) -> CoreResult<usize> {
        self.cancel(&CancelFilter::Rule(rule_id), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::store::{ActivityStore, CatalogStore, InMemoryFleetStore};
    use armada_activities::{ProvisioningStep, Status};
    use armada_catalog::{AudienceRule, AutomationRule, DefinitionSpec, Host, OperationDefinition, Payload};
    use armada_core::{StepId, UnitId, WorkflowId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> ActivityQueue<Arc<InMemoryFleetStore>> {
        ActivityQueue::new(InMemoryFleetStore::arc())
    }

    fn host(queue: &ActivityQueue<Arc<InMemoryFleetStore>>, labels: &[&str]) -> HostId {
        let host = Host::new(UnitId::global(), "mac-01").with_labels(labels.iter().copied());
        let id = host.id;
        queue.store().upsert_host(host).unwrap();
        id
    }

    fn package(queue: &ActivityQueue<Arc<InMemoryFleetStore>>, title: &str) -> DefinitionId {
        let spec = DefinitionSpec::new(title, "apps", Payload::package(title, "install.sh", "uninstall.sh"));
        queue.store().insert_definition(UnitId::global(), spec, Utc::now()).unwrap().id
    }

    #[test]
    fn activation_follows_enqueue_order() {
        let queue = queue();
        let h = host(&queue, &[]);
        let d1 = package(&queue, "one");
        let d2 = package(&queue, "two");
        let now = Utc::now();

        let e1 = queue.enqueue(h, d1, ActivityKind::Install, EnqueueOptions::default(), now).unwrap();
        let e2 = queue.enqueue(h, d2, ActivityKind::Install, EnqueueOptions::default(), now).unwrap();

        let first = queue.activate_next(h, now).unwrap().unwrap();
        assert_eq!(first.execution_id, e1);
        assert!(queue.activate_next(h, now).unwrap().is_none());

        let recorded = queue.record_result(h, e1, ExecutionOutcome::installed(0), now).unwrap();
        match recorded {
            RecordOutcome::Completed { status, next } => {
                assert_eq!(status, Status::Succeeded);
                assert_eq!(next.map(|a| a.execution_id), Some(e2));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn get_result_and_aggregate_require_known_ids() {
        let queue = queue();
        assert!(queue.get_result(ExecutionId::new()).unwrap_err().is_not_found());
        assert!(queue.aggregate_status(DefinitionId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn rule_enqueues_only_matching_idle_hosts() {
        let queue = queue();
        let laptop = host(&queue, &["laptops"]);
        let server = host(&queue, &["servers"]);
        let spec = DefinitionSpec::new("vpn", "apps", Payload::package("vpn", "i", "u"))
            .with_audience(AudienceRule::include_any(["laptops"]));
        let def = queue.store().insert_definition(UnitId::global(), spec, Utc::now()).unwrap();
        let rule = AutomationRule::new(UnitId::global(), "vpn everywhere", def.id);
        let rule_id = rule.id;
        queue.store().upsert_rule(rule).unwrap();

        let now = Utc::now();
        let queued = queue.enqueue_for_rule(rule_id, &[laptop, server], now).unwrap();
        assert_eq!(queued.len(), 1);
        let pending = queue.list_pending(laptop).unwrap();
        assert_eq!(pending[0].cause, armada_activities::Cause::Automation(rule_id));
        assert!(queue.list_pending(server).unwrap().is_empty());

        // Second evaluation finds the host busy with the same definition.
        assert!(queue.enqueue_for_rule(rule_id, &[laptop], now).unwrap().is_empty());

        assert_eq!(queue.cancel_for_rule(rule_id, now).unwrap(), 1);
        assert!(queue.list_pending(laptop).unwrap().is_empty());
    }

    /// Store whose first activation attempts lose a race.
    struct Racy {
        inner: InMemoryFleetStore,
        conflicts: AtomicUsize,
    }

    impl CatalogStore for Racy {
        fn upsert_host(&self, host: Host) -> StoreResult<()> {
            self.inner.upsert_host(host)
        }
        fn host(&self, id: HostId) -> StoreResult<Option<Host>> {
            self.inner.host(id)
        }
        fn insert_definition(
            &self,
            unit: UnitId,
            spec: DefinitionSpec,
            now: DateTime<Utc>,
        ) -> StoreResult<OperationDefinition> {
            self.inner.insert_definition(unit, spec, now)
        }
        fn definition(&self, id: DefinitionId) -> StoreResult<Option<OperationDefinition>> {
            self.inner.definition(id)
        }
        fn definitions(&self, unit: UnitId) -> StoreResult<Vec<OperationDefinition>> {
            self.inner.definitions(unit)
        }
        fn replace_definitions(
            &self,
            unit: UnitId,
            desired: &[DefinitionSpec],
            now: DateTime<Utc>,
        ) -> StoreResult<crate::store::ReplaceSummary> {
            self.inner.replace_definitions(unit, desired, now)
        }
        fn delete_definition(&self, id: DefinitionId, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
            self.inner.delete_definition(id, now)
        }
        fn upsert_rule(&self, rule: AutomationRule) -> StoreResult<()> {
            self.inner.upsert_rule(rule)
        }
        fn rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
            self.inner.rule(id)
        }
        fn delete_rule(&self, id: RuleId) -> StoreResult<()> {
            self.inner.delete_rule(id)
        }
    }

    impl ActivityStore for Racy {
        fn enqueue(
            &self,
            host: HostId,
            definition: DefinitionId,
            kind: ActivityKind,
            options: EnqueueOptions,
            now: DateTime<Utc>,
        ) -> StoreResult<Activity> {
            self.inner.enqueue(host, definition, kind, options, now)
        }
        fn enqueue_if_idle(
            &self,
            host: HostId,
            definition: DefinitionId,
            kind: ActivityKind,
            options: EnqueueOptions,
            now: DateTime<Utc>,
        ) -> StoreResult<Option<Activity>> {
            self.inner.enqueue_if_idle(host, definition, kind, options, now)
        }
        fn activate_next(
            &self,
            host: HostId,
            selector: &dyn ActivationSelector,
            now: DateTime<Utc>,
        ) -> StoreResult<Option<Activity>> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Conflict("unique violation".into()));
            }
            self.inner.activate_next(host, selector, now)
        }
        fn record_result(
            &self,
            host: HostId,
            execution_id: ExecutionId,
            outcome: ExecutionOutcome,
            selector: &dyn ActivationSelector,
            now: DateTime<Utc>,
        ) -> StoreResult<RecordOutcome> {
            self.inner.record_result(host, execution_id, outcome, selector, now)
        }
        fn cancel(&self, filter: &CancelFilter, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
            self.inner.cancel(filter, now)
        }
        fn list_pending(&self, host: HostId) -> StoreResult<Vec<Activity>> {
            self.inner.list_pending(host)
        }
        fn activity(&self, execution_id: ExecutionId) -> StoreResult<Option<Activity>> {
            self.inner.activity(execution_id)
        }
        fn activities_for_definition(&self, definition: DefinitionId) -> StoreResult<Vec<Activity>> {
            self.inner.activities_for_definition(definition)
        }
        fn enqueue_step(
            &self,
            workflow_id: WorkflowId,
            host: HostId,
            definition: DefinitionId,
            now: DateTime<Utc>,
        ) -> StoreResult<(Activity, ProvisioningStep)> {
            self.inner.enqueue_step(workflow_id, host, definition, now)
        }
        fn steps(&self, workflow_id: WorkflowId) -> StoreResult<Vec<ProvisioningStep>> {
            self.inner.steps(workflow_id)
        }
        fn retarget_step(&self, step_id: StepId, now: DateTime<Utc>) -> StoreResult<ProvisioningStep> {
            self.inner.retarget_step(step_id, now)
        }
    }

    fn racy(conflicts: usize) -> (ActivityQueue<Arc<Racy>>, HostId) {
        let store = Arc::new(Racy {
            inner: InMemoryFleetStore::new(),
            conflicts: AtomicUsize::new(conflicts),
        });
        let host = Host::new(UnitId::global(), "mac-02");
        let host_id = host.id;
        store.upsert_host(host).unwrap();
        let spec = DefinitionSpec::new("app", "apps", Payload::script("echo hi"));
        let def = store.insert_definition(UnitId::global(), spec, Utc::now()).unwrap();
        store
            .enqueue(host_id, def.id, ActivityKind::Script, EnqueueOptions::default(), Utc::now())
            .unwrap();
        (ActivityQueue::new(store), host_id)
    }

    #[test]
    fn conflicts_are_retried_locally() {
        let (queue, host) = racy(MAX_ACTIVATION_ATTEMPTS - 1);
        assert!(queue.activate_next(host, Utc::now()).unwrap().is_some());
    }

    #[test]
    fn persistent_conflict_is_surfaced() {
        let (queue, host) = racy(MAX_ACTIVATION_ATTEMPTS);
        let err = queue.activate_next(host, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
