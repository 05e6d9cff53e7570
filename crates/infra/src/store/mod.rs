//! Storage boundaries for the catalog and the host activity queue.
//!
//! Every trait method is one atomic step: the in-memory store holds a single
//! lock for the whole call, the Postgres store runs it in one transaction.
//! Multi-step mutations (complete-and-advance, replace-and-cancel) are
//! therefore exposed as single methods rather than composed by callers.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use armada_activities::{
    ActivationSelector, Activity, ActivityKind, EnqueueOptions, ExecutionOutcome, ProvisioningStep, Status,
};
use armada_catalog::{AutomationRule, DefinitionSpec, Host, OperationDefinition};
use armada_core::{DefinitionId, ExecutionId, HostId, RuleId, StepId, UnitId, WorkflowId};

use crate::error::StoreResult;

pub use memory::InMemoryFleetStore;
pub use postgres::PostgresFleetStore;

/// Which queued activities to cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelFilter {
    Executions(Vec<ExecutionId>),
    Definition(DefinitionId),
    Host(HostId),
    Rule(RuleId),
}

impl CancelFilter {
    pub fn matches(&self, activity: &Activity) -> bool {
        match self {
            CancelFilter::Executions(ids) => ids.contains(&activity.execution_id),
            CancelFilter::Definition(id) => activity.definition_id == *id,
            CancelFilter::Host(id) => activity.host == *id,
            CancelFilter::Rule(id) => {
                activity.cause == armada_activities::Cause::Automation(*id)
            }
        }
    }
}

/// Result of recording a transport report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The activity completed; `next` is whatever was activated after it.
    Completed { status: Status, next: Option<Activity> },
    /// Partial report stored, the activity is still in flight.
    InProgress { status: Status },
    /// Duplicate report, nothing changed.
    AlreadyCompleted { status: Status },
}

impl RecordOutcome {
    pub fn status(&self) -> Status {
        match self {
            RecordOutcome::Completed { status, .. }
            | RecordOutcome::InProgress { status }
            | RecordOutcome::AlreadyCompleted { status } => *status,
        }
    }
}

/// What an applied replace did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub inserted: Vec<DefinitionId>,
    pub updated: Vec<DefinitionId>,
    pub removed: Vec<DefinitionId>,
    pub unchanged: usize,
    pub cancelled: Vec<ExecutionId>,
}

pub trait CatalogStore: Send + Sync {
    fn upsert_host(&self, host: Host) -> StoreResult<()>;

    fn host(&self, id: HostId) -> StoreResult<Option<Host>>;

    /// Insert a single definition. Fails with `Conflict` when its key is taken.
    fn insert_definition(
        &self,
        unit: UnitId,
        spec: DefinitionSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<OperationDefinition>;

    fn definition(&self, id: DefinitionId) -> StoreResult<Option<OperationDefinition>>;

    fn definitions(&self, unit: UnitId) -> StoreResult<Vec<OperationDefinition>>;

    /// Apply a desired definition set to a unit and cancel stale queued
    /// activities, all or nothing.
    fn replace_definitions(
        &self,
        unit: UnitId,
        desired: &[DefinitionSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<ReplaceSummary>;

    /// Delete a definition and cancel its queued activities.
    fn delete_definition(&self, id: DefinitionId, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>>;

    /// The definition must exist.
    fn upsert_rule(&self, rule: AutomationRule) -> StoreResult<()>;

    fn rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>>;

    fn delete_rule(&self, id: RuleId) -> StoreResult<()>;
}

pub trait ActivityStore: Send + Sync {
    /// Create a queued activity. Host and definition must exist.
    fn enqueue(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Activity>;

    /// Like `enqueue`, but returns `None` when the host already has a queued
    /// or active activity for the definition.
    fn enqueue_if_idle(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>>;

    /// Activate the selected queued activity unless the host already has one
    /// in flight.
    fn activate_next(
        &self,
        host: HostId,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>>;

    /// Record a report; a terminal one completes the activity and activates
    /// the next in the same step.
    fn record_result(
        &self,
        host: HostId,
        execution_id: ExecutionId,
        outcome: ExecutionOutcome,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<RecordOutcome>;

    /// Cancel matching queued activities. Returns what was cancelled.
    fn cancel(&self, filter: &CancelFilter, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>>;

    /// Active activity (if any) followed by queued ones in FIFO order.
    fn list_pending(&self, host: HostId) -> StoreResult<Vec<Activity>>;

    fn activity(&self, execution_id: ExecutionId) -> StoreResult<Option<Activity>>;

    fn activities_for_definition(&self, definition: DefinitionId) -> StoreResult<Vec<Activity>>;

    /// Enqueue an install tracked by a provisioning step.
    fn enqueue_step(
        &self,
        workflow_id: WorkflowId,
        host: HostId,
        definition: DefinitionId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Activity, ProvisioningStep)>;

    fn steps(&self, workflow_id: WorkflowId) -> StoreResult<Vec<ProvisioningStep>>;

    /// Enqueue a fresh install for a cancelled step and point the step at it.
    fn retarget_step(&self, step_id: StepId, now: DateTime<Utc>) -> StoreResult<ProvisioningStep>;
}

/// Both halves of the fleet state behind one store.
pub trait FleetStore: CatalogStore + ActivityStore {}

impl<T: CatalogStore + ActivityStore> FleetStore for T {}

impl<T: CatalogStore + ?Sized> CatalogStore for Arc<T> {
    fn upsert_host(&self, host: Host) -> StoreResult<()> {
        (**self).upsert_host(host)
    }

    fn host(&self, id: HostId) -> StoreResult<Option<Host>> {
        (**self).host(id)
    }

    fn insert_definition(
        &self,
        unit: UnitId,
        spec: DefinitionSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<OperationDefinition> {
        (**self).insert_definition(unit, spec, now)
    }

    fn definition(&self, id: DefinitionId) -> StoreResult<Option<OperationDefinition>> {
        (**self).definition(id)
    }

    fn definitions(&self, unit: UnitId) -> StoreResult<Vec<OperationDefinition>> {
        (**self).definitions(unit)
    }

    fn replace_definitions(
        &self,
        unit: UnitId,
        desired: &[DefinitionSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<ReplaceSummary> {
        (**self).replace_definitions(unit, desired, now)
    }

    fn delete_definition(&self, id: DefinitionId, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        (**self).delete_definition(id, now)
    }

    fn upsert_rule(&self, rule: AutomationRule) -> StoreResult<()> {
        (**self).upsert_rule(rule)
    }

    fn rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
        (**self).rule(id)
    }

    fn delete_rule(&self, id: RuleId) -> StoreResult<()> {
        (**self).delete_rule(id)
    }
}

impl<T: ActivityStore + ?Sized> ActivityStore for Arc<T> {
    fn enqueue(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Activity> {
        (**self).enqueue(host, definition, kind, options, now)
    }

    fn enqueue_if_idle(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        (**self).enqueue_if_idle(host, definition, kind, options, now)
    }

    fn activate_next(
        &self,
        host: HostId,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        (**self).activate_next(host, selector, now)
    }

    fn record_result(
        &self,
        host: HostId,
        execution_id: ExecutionId,
        outcome: ExecutionOutcome,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<RecordOutcome> {
        (**self).record_result(host, execution_id, outcome, selector, now)
    }

    fn cancel(&self, filter: &CancelFilter, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        (**self).cancel(filter, now)
    }

    fn list_pending(&self, host: HostId) -> StoreResult<Vec<Activity>> {
        (**self).list_pending(host)
    }

    fn activity(&self, execution_id: ExecutionId) -> StoreResult<Option<Activity>> {
        (**self).activity(execution_id)
    }

    fn activities_for_definition(&self, definition: DefinitionId) -> StoreResult<Vec<Activity>> {
        (**self).activities_for_definition(definition)
    }

    fn enqueue_step(
        &self,
        workflow_id: WorkflowId,
        host: HostId,
        definition: DefinitionId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Activity, ProvisioningStep)> {
        (**self).enqueue_step(workflow_id, host, definition, now)
    }

    fn steps(&self, workflow_id: WorkflowId) -> StoreResult<Vec<ProvisioningStep>> {
        (**self).steps(workflow_id)
    }

    fn retarget_step(&self, step_id: StepId, now: DateTime<Utc>) -> StoreResult<ProvisioningStep> {
        (**self).retarget_step(step_id, now)
    }
}
