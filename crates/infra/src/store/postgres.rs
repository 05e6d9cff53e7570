//! Postgres-backed fleet store.
//!
//! Every trait method runs as one transaction. The schema lives in
//! `schema.sql` and is applied with [`PostgresFleetStore::ensure_schema`].
//!
//! ## Single-flight activation
//!
//! Activation locks the host row (`SELECT ... FOR UPDATE`), checks that no
//! activity is active, selects among the queued rows and flips the chosen one
//! with a conditional update (`... AND state = 'queued'`). The partial unique
//! index `activities_one_active_per_host` is the last line: a second active
//! row for a host fails with a unique violation, reported as `Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization / deadlock) | `40001`, `40P01` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed, network, decode | N/A | `Backend` |
//!
//! ## Blocking adapter
//!
//! The store traits are synchronous. The async inherent methods are driven on
//! the runtime handle passed to [`PostgresFleetStore::new`]; trait methods
//! must therefore be called from threads that are not runtime workers (the
//! job executor threads, `spawn_blocking`).

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, field, instrument};
use uuid::Uuid;

use armada_activities::{
    ActivationSelector, Activity, ActivityKind, Cause, Delivery, EnqueueOptions, ExecutionOutcome, ExecutionResult,
    ProvisioningStep, QueueState, RecordDisposition, StepStatus,
};
use armada_catalog::{
    AutomationRule, DefinitionSpec, Host, OperationDefinition, deletion_guard, plan_replace,
};
use armada_core::{CoreError, DefinitionId, ExecutionId, HostId, RuleId, StepId, UnitId, WorkflowId};

use super::{ActivityStore, CancelFilter, CatalogStore, RecordOutcome, ReplaceSummary};
use crate::error::{StoreError, StoreResult};

/// DDL for every table the orchestration core uses.
pub const SCHEMA: &str = include_str!("schema.sql");

const ACTIVITY_COLUMNS: &str = "execution_id, host_id, definition_id, definition_title, kind, cause, state, \
     seq, created_at, activated_at, finished_at, delivery, result";

const DEFINITION_COLUMNS: &str = "id, unit_id, spec, revision, created_at, updated_at";

const STEP_COLUMNS: &str = "id, workflow_id, host_id, definition_id, execution_id, status, updated_at";

/// Open a connection pool.
pub async fn connect(url: &str, max_connections: u32) -> StoreResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

#[derive(Debug, Clone)]
pub struct PostgresFleetStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresFleetStore {
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, host), fields(host_id = %host.id), err)]
    pub async fn upsert_host(&self, host: Host) -> StoreResult<()> {
        let labels: Vec<String> = host.labels.into_iter().collect();
        sqlx::query(
            r#"
            INSERT INTO hosts (id, unit_id, hostname, labels, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (id) DO UPDATE SET
                unit_id = EXCLUDED.unit_id,
                hostname = EXCLUDED.hostname,
                labels = EXCLUDED.labels,
                updated_at = NOW()
            "#,
        )
        .bind(host.id.as_uuid())
        .bind(host.unit.as_uuid())
        .bind(&host.hostname)
        .bind(&labels)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_host", e))?;
        Ok(())
    }

    pub async fn host(&self, id: HostId) -> StoreResult<Option<Host>> {
        let row = sqlx::query("SELECT id, unit_id, hostname, labels FROM hosts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("host", e))?;
        row.as_ref().map(host_from_row).transpose()
    }

    #[instrument(skip(self, spec), fields(unit_id = %unit, title = %spec.title), err)]
    pub async fn insert_definition(
        &self,
        unit: UnitId,
        spec: DefinitionSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<OperationDefinition> {
        spec.validate()?;
        let def = OperationDefinition::new(unit, spec, now);
        let mut tx = self.begin().await?;
        insert_definition_row(&mut tx, &def).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(def)
    }

    pub async fn definition(&self, id: DefinitionId) -> StoreResult<Option<OperationDefinition>> {
        let sql = format!("SELECT {DEFINITION_COLUMNS} FROM operation_definitions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("definition", e))?;
        row.as_ref().map(definition_from_row).transpose()
    }

    pub async fn definitions(&self, unit: UnitId) -> StoreResult<Vec<OperationDefinition>> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM operation_definitions WHERE unit_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(unit.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("definitions", e))?;
        rows.iter().map(definition_from_row).collect()
    }

    /// Diff, apply and cancel inside one transaction.
    #[instrument(
        skip(self, desired),
        fields(
            unit_id = %unit,
            desired = desired.len(),
            cancelled = field::Empty
        ),
        err
    )]
    pub async fn replace_definitions(
        &self,
        unit: UnitId,
        desired: &[DefinitionSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<ReplaceSummary> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM operation_definitions WHERE unit_id = $1 ORDER BY created_at, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(unit.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_definitions", e))?;
        let current: Vec<OperationDefinition> =
            rows.iter().map(definition_from_row).collect::<StoreResult<_>>()?;

        let plan = plan_replace(&current, desired)?;

        for id in &plan.removals {
            if let Some(def) = current.iter().find(|d| d.id == *id) {
                removal_guard(&mut tx, def).await?;
            }
        }

        let mut summary = ReplaceSummary {
            unchanged: plan.unchanged.len(),
            ..ReplaceSummary::default()
        };

        let stale: Vec<DefinitionId> = plan.cancelled_definitions().collect();
        for id in stale {
            let cancelled = cancel_in_tx(&mut tx, &CancelFilter::Definition(id), now).await?;
            summary.cancelled.extend(cancelled);
        }

        for spec in plan.inserts {
            let def = OperationDefinition::new(unit, spec, now);
            insert_definition_row(&mut tx, &def).await?;
            summary.inserted.push(def.id);
        }

        for update in plan.updates {
            let Some(existing) = current.iter().find(|d| d.id == update.id) else {
                continue;
            };
            let mut def = existing.clone();
            def.replace_spec(update.spec, now);
            update_definition_row(&mut tx, &def).await?;
            summary.updated.push(def.id);
        }

        for id in plan.removals {
            sqlx::query("DELETE FROM operation_definitions WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_definition", e))?;
            summary.removed.push(id);
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("cancelled", summary.cancelled.len());
        Ok(summary)
    }

    #[instrument(skip(self), fields(definition_id = %id), err)]
    pub async fn delete_definition(&self, id: DefinitionId, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        let mut tx = self.begin().await?;

        let sql = format!("SELECT {DEFINITION_COLUMNS} FROM operation_definitions WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_definition", e))?;
        let def = row
            .as_ref()
            .map(definition_from_row)
            .transpose()?
            .ok_or_else(|| CoreError::not_found("definition", id))?;

        removal_guard(&mut tx, &def).await?;
        let cancelled = cancel_in_tx(&mut tx, &CancelFilter::Definition(id), now).await?;

        sqlx::query("DELETE FROM operation_definitions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_definition", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(cancelled)
    }

    pub async fn upsert_rule(&self, rule: AutomationRule) -> StoreResult<()> {
        if self.definition(rule.definition_id).await?.is_none() {
            return Err(CoreError::not_found("definition", rule.definition_id).into());
        }
        sqlx::query(
            r#"
            INSERT INTO automation_rules (id, unit_id, name, definition_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                unit_id = EXCLUDED.unit_id,
                name = EXCLUDED.name,
                definition_id = EXCLUDED.definition_id
            "#,
        )
        .bind(rule.id.as_uuid())
        .bind(rule.unit.as_uuid())
        .bind(&rule.name)
        .bind(rule.definition_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_rule", e))?;
        Ok(())
    }

    pub async fn rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
        let row = sqlx::query("SELECT id, unit_id, name, definition_id FROM automation_rules WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("rule", e))?;
        row.as_ref()
            .map(|row| {
                Ok(AutomationRule {
                    id: RuleId::from_uuid(get(row, "id")?),
                    unit: UnitId::from_uuid(get(row, "unit_id")?),
                    name: get(row, "name")?,
                    definition_id: DefinitionId::from_uuid(get(row, "definition_id")?),
                })
            })
            .transpose()
    }

    pub async fn delete_rule(&self, id: RuleId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM automation_rules WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_rule", e))?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("automation rule", id).into());
        }
        Ok(())
    }

    #[instrument(skip(self, options), fields(host_id = %host, definition_id = %definition, kind = %kind), err)]
    pub async fn enqueue(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Activity> {
        let mut tx = self.begin().await?;
        let mut activity = build_activity(&mut tx, host, definition, kind, options, now).await?;
        insert_activity_row(&mut tx, &mut activity).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(activity)
    }

    #[instrument(skip(self, options), fields(host_id = %host, definition_id = %definition), err)]
    pub async fn enqueue_if_idle(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        let mut tx = self.begin().await?;
        lock_host(&mut tx, host).await?;

        let mut activity = build_activity(&mut tx, host, definition, kind, options, now).await?;
        let pending: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT execution_id FROM activities
            WHERE host_id = $1 AND definition_id = $2 AND state IN ('queued', 'active')
            LIMIT 1
            "#,
        )
        .bind(host.as_uuid())
        .bind(definition.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("pending_for_definition", e))?;

        if pending.is_some() {
            tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(None);
        }

        insert_activity_row(&mut tx, &mut activity).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(activity))
    }

    #[instrument(skip(self, selector), fields(host_id = %host, activated = field::Empty), err)]
    pub async fn activate_next(
        &self,
        host: HostId,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        let mut tx = self.begin().await?;
        let activated = activate_in_tx(&mut tx, host, selector, now).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if let Some(a) = &activated {
            Span::current().record("activated", field::display(a.execution_id));
        }
        Ok(activated)
    }

    #[instrument(
        skip(self, outcome, selector),
        fields(host_id = %host, execution_id = %execution_id),
        err
    )]
    pub async fn record_result(
        &self,
        host: HostId,
        execution_id: ExecutionId,
        outcome: ExecutionOutcome,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<RecordOutcome> {
        let mut tx = self.begin().await?;

        if !host_locked(&mut tx, host).await? {
            return Err(CoreError::not_found("activity", execution_id).into());
        }

        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE execution_id = $1 AND host_id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(execution_id.as_uuid())
            .bind(host.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_activity", e))?;
        let mut activity = row
            .as_ref()
            .map(activity_from_row)
            .transpose()?
            .ok_or_else(|| CoreError::not_found("activity", execution_id))?;

        let outcome = match activity.record(outcome, now)? {
            RecordDisposition::AlreadyCompleted(status) => RecordOutcome::AlreadyCompleted { status },
            RecordDisposition::InProgress(status) => {
                sqlx::query("UPDATE activities SET result = $2 WHERE execution_id = $1")
                    .bind(execution_id.as_uuid())
                    .bind(activity.result.as_ref().map(Json))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("store_partial_result", e))?;
                RecordOutcome::InProgress { status }
            }
            RecordDisposition::Completed(status) => {
                sqlx::query(
                    r#"
                    UPDATE activities
                    SET state = 'completed', result = $2, finished_at = $3
                    WHERE execution_id = $1 AND state = 'active'
                    "#,
                )
                .bind(execution_id.as_uuid())
                .bind(activity.result.as_ref().map(Json))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("complete_activity", e))?;
                sync_steps(&mut tx, &activity, now).await?;

                let next = activate_in_tx(&mut tx, host, selector, now).await?;
                RecordOutcome::Completed { status, next }
            }
        };

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self), err)]
    pub async fn cancel(&self, filter: &CancelFilter, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        let mut tx = self.begin().await?;
        let cancelled = cancel_in_tx(&mut tx, filter, now).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(cancelled)
    }

    pub async fn list_pending(&self, host: HostId) -> StoreResult<Vec<Activity>> {
        let sql = format!(
            r#"
            SELECT {ACTIVITY_COLUMNS} FROM activities
            WHERE host_id = $1 AND state IN ('queued', 'active')
            ORDER BY (state = 'active') DESC, created_at, seq
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(host.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_pending", e))?;
        rows.iter().map(activity_from_row).collect()
    }

    pub async fn activity(&self, execution_id: ExecutionId) -> StoreResult<Option<Activity>> {
        let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE execution_id = $1");
        let row = sqlx::query(&sql)
            .bind(execution_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("activity", e))?;
        row.as_ref().map(activity_from_row).transpose()
    }

    pub async fn activities_for_definition(&self, definition: DefinitionId) -> StoreResult<Vec<Activity>> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE definition_id = $1 ORDER BY created_at, seq"
        );
        let rows = sqlx::query(&sql)
            .bind(definition.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("activities_for_definition", e))?;
        rows.iter().map(activity_from_row).collect()
    }

    #[instrument(skip(self), fields(workflow_id = %workflow_id, host_id = %host), err)]
    pub async fn enqueue_step(
        &self,
        workflow_id: WorkflowId,
        host: HostId,
        definition: DefinitionId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Activity, ProvisioningStep)> {
        let mut tx = self.begin().await?;
        let mut activity = build_activity(
            &mut tx,
            host,
            definition,
            ActivityKind::Install,
            EnqueueOptions::provisioning(workflow_id),
            now,
        )
        .await?;
        insert_activity_row(&mut tx, &mut activity).await?;

        let step = ProvisioningStep::for_activity(workflow_id, &activity, now);
        sqlx::query(
            r#"
            INSERT INTO provisioning_steps (id, workflow_id, host_id, definition_id, execution_id, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.workflow_id.as_uuid())
        .bind(step.host.as_uuid())
        .bind(step.definition_id.as_uuid())
        .bind(step.execution_id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_step", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((activity, step))
    }

    pub async fn steps(&self, workflow_id: WorkflowId) -> StoreResult<Vec<ProvisioningStep>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM provisioning_steps WHERE workflow_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(workflow_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("steps", e))?;
        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self), fields(step_id = %step_id), err)]
    pub async fn retarget_step(&self, step_id: StepId, now: DateTime<Utc>) -> StoreResult<ProvisioningStep> {
        let mut tx = self.begin().await?;

        let sql = format!("SELECT {STEP_COLUMNS} FROM provisioning_steps WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(step_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_step", e))?;
        let mut step = row
            .as_ref()
            .map(step_from_row)
            .transpose()?
            .ok_or_else(|| CoreError::not_found("provisioning step", step_id))?;

        let mut activity = build_activity(
            &mut tx,
            step.host,
            step.definition_id,
            ActivityKind::Install,
            EnqueueOptions::provisioning(step.workflow_id),
            now,
        )
        .await?;
        step.retarget(&activity, now)?;
        insert_activity_row(&mut tx, &mut activity).await?;

        sqlx::query(
            r#"
            UPDATE provisioning_steps
            SET definition_id = $2, execution_id = $3, status = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.definition_id.as_uuid())
        .bind(step.execution_id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retarget_step", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(step)
    }
}

async fn lock_host(tx: &mut Transaction<'_, Postgres>, host: HostId) -> StoreResult<()> {
    if host_locked(tx, host).await? {
        Ok(())
    } else {
        Err(CoreError::not_found("host", host).into())
    }
}

/// Lock the host row; `false` when the host does not exist.
async fn host_locked(tx: &mut Transaction<'_, Postgres>, host: HostId) -> StoreResult<bool> {
    let row = sqlx::query("SELECT id FROM hosts WHERE id = $1 FOR UPDATE")
        .bind(host.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_host", e))?;
    Ok(row.is_some())
}

async fn build_activity(
    tx: &mut Transaction<'_, Postgres>,
    host: HostId,
    definition: DefinitionId,
    kind: ActivityKind,
    options: EnqueueOptions,
    now: DateTime<Utc>,
) -> StoreResult<Activity> {
    let known_host = sqlx::query("SELECT id FROM hosts WHERE id = $1")
        .bind(host.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("host_exists", e))?;
    if known_host.is_none() {
        return Err(CoreError::not_found("host", host).into());
    }

    let def = fetch_definition(tx, definition)
        .await?
        .ok_or_else(|| CoreError::not_found("definition", definition))?;
    Ok(Activity::new(host, &def, kind, options, 0, now)?)
}

async fn insert_activity_row(tx: &mut Transaction<'_, Postgres>, activity: &mut Activity) -> StoreResult<()> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO activities (
            execution_id, host_id, definition_id, definition_title, kind, cause, state, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING seq
        "#,
    )
    .bind(activity.execution_id.as_uuid())
    .bind(activity.host.as_uuid())
    .bind(activity.definition_id.as_uuid())
    .bind(&activity.definition_title)
    .bind(activity.kind.as_str())
    .bind(Json(&activity.cause))
    .bind(activity.state.as_str())
    .bind(activity.created_at)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_activity", e))?;
    activity.seq = seq as u64;
    Ok(())
}

async fn fetch_definition(
    tx: &mut Transaction<'_, Postgres>,
    id: DefinitionId,
) -> StoreResult<Option<OperationDefinition>> {
    let sql = format!("SELECT {DEFINITION_COLUMNS} FROM operation_definitions WHERE id = $1");
    let row = sqlx::query(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("fetch_definition", e))?;
    row.as_ref().map(definition_from_row).transpose()
}

async fn insert_definition_row(tx: &mut Transaction<'_, Postgres>, def: &OperationDefinition) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO operation_definitions (
            id, unit_id, definition_key, title, spec, revision, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(def.id.as_uuid())
    .bind(def.unit.as_uuid())
    .bind(definition_key(def)?)
    .bind(def.title())
    .bind(Json(&def.spec))
    .bind(def.revision as i32)
    .bind(def.created_at)
    .bind(def.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_definition", e))?;
    Ok(())
}

async fn update_definition_row(tx: &mut Transaction<'_, Postgres>, def: &OperationDefinition) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE operation_definitions
        SET definition_key = $2, title = $3, spec = $4, revision = $5, updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(def.id.as_uuid())
    .bind(definition_key(def)?)
    .bind(def.title())
    .bind(Json(&def.spec))
    .bind(def.revision as i32)
    .bind(def.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_definition", e))?;
    Ok(())
}

fn definition_key(def: &OperationDefinition) -> StoreResult<String> {
    serde_json::to_string(&def.key()).map_err(|e| StoreError::backend(format!("failed to encode definition key: {e}")))
}

async fn removal_guard(tx: &mut Transaction<'_, Postgres>, def: &OperationDefinition) -> StoreResult<()> {
    let rules: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM automation_rules WHERE definition_id = $1")
        .bind(def.id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("count_rules", e))?;
    let active: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM activities WHERE definition_id = $1 AND state = 'active'")
            .bind(def.id.as_uuid())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("count_active", e))?;
    Ok(deletion_guard(def, rules as usize, active as usize)?)
}

/// Activate the next activity for `host` inside an open transaction.
async fn activate_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    host: HostId,
    selector: &dyn ActivationSelector,
    now: DateTime<Utc>,
) -> StoreResult<Option<Activity>> {
    lock_host(tx, host).await?;

    let busy: Option<Uuid> =
        sqlx::query_scalar("SELECT execution_id FROM activities WHERE host_id = $1 AND state = 'active' LIMIT 1")
            .bind(host.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("active_for_host", e))?;
    if let Some(current) = busy {
        debug!(host_id = %host, execution_id = %current, "host already has an active activity");
        return Ok(None);
    }

    let sql = format!(
        "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE host_id = $1 AND state = 'queued' ORDER BY created_at, seq"
    );
    let rows = sqlx::query(&sql)
        .bind(host.as_uuid())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("queued_for_host", e))?;
    let queued: Vec<Activity> = rows.iter().map(activity_from_row).collect::<StoreResult<_>>()?;

    let Some(pick) = selector.select(host, &queued) else {
        return Ok(None);
    };
    let mut activity = pick.clone();

    let def = fetch_definition(tx, activity.definition_id)
        .await?
        .ok_or_else(|| CoreError::not_found("definition", activity.definition_id))?;
    let delivery = Delivery::materialize(activity.kind, &def.spec.payload, host, activity.execution_id)?;
    activity.activate(delivery, now)?;

    let updated = sqlx::query(
        r#"
        UPDATE activities
        SET state = 'active', activated_at = $2, delivery = $3
        WHERE execution_id = $1 AND state = 'queued'
        "#,
    )
    .bind(activity.execution_id.as_uuid())
    .bind(now)
    .bind(activity.delivery.as_ref().map(Json))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("activate", e))?;

    if updated.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "activity {} left the queue during activation",
            activity.execution_id
        )));
    }

    sync_steps(tx, &activity, now).await?;
    Ok(Some(activity))
}

async fn sync_steps(tx: &mut Transaction<'_, Postgres>, activity: &Activity, now: DateTime<Utc>) -> StoreResult<()> {
    let status = StepStatus::of(activity);
    sqlx::query(
        r#"
        UPDATE provisioning_steps
        SET status = $2, updated_at = $3
        WHERE execution_id = $1 AND status <> $2
        "#,
    )
    .bind(activity.execution_id.as_uuid())
    .bind(status.as_str())
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("sync_steps", e))?;
    Ok(())
}

/// Cancel queued activities matching `filter` and mark their steps.
async fn cancel_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    filter: &CancelFilter,
    now: DateTime<Utc>,
) -> StoreResult<Vec<ExecutionId>> {
    const CANCEL: &str = "UPDATE activities SET state = 'cancelled', finished_at = $1 WHERE state = 'queued' AND";

    let query = match filter {
        CancelFilter::Executions(ids) => {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
            sqlx::query_scalar::<_, Uuid>(&format!("{CANCEL} execution_id = ANY($2) RETURNING execution_id"))
                .bind(now)
                .bind(ids)
                .fetch_all(&mut **tx)
                .await
        }
        CancelFilter::Definition(id) => {
            sqlx::query_scalar::<_, Uuid>(&format!("{CANCEL} definition_id = $2 RETURNING execution_id"))
                .bind(now)
                .bind(id.as_uuid())
                .fetch_all(&mut **tx)
                .await
        }
        CancelFilter::Host(id) => {
            sqlx::query_scalar::<_, Uuid>(&format!("{CANCEL} host_id = $2 RETURNING execution_id"))
                .bind(now)
                .bind(id.as_uuid())
                .fetch_all(&mut **tx)
                .await
        }
        CancelFilter::Rule(id) => {
            sqlx::query_scalar::<_, Uuid>(&format!(
                "{CANCEL} cause->>'type' = 'automation' AND cause->>'id' = $2 RETURNING execution_id"
            ))
            .bind(now)
            .bind(id.to_string())
            .fetch_all(&mut **tx)
            .await
        }
    };
    let mut cancelled = query.map_err(|e| map_sqlx_error("cancel_activities", e))?;

    if !cancelled.is_empty() {
        sqlx::query(
            r#"
            UPDATE provisioning_steps
            SET status = 'cancelled', updated_at = $1
            WHERE execution_id = ANY($2)
            "#,
        )
        .bind(now)
        .bind(&cancelled)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_steps", e))?;
    }

    cancelled.sort();
    Ok(cancelled.into_iter().map(ExecutionId::from_uuid).collect())
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::backend(format!("failed to read column {column}: {e}")))
}

fn host_from_row(row: &PgRow) -> StoreResult<Host> {
    let labels: Vec<String> = get(row, "labels")?;
    Ok(Host {
        id: HostId::from_uuid(get(row, "id")?),
        unit: UnitId::from_uuid(get(row, "unit_id")?),
        hostname: get(row, "hostname")?,
        labels: labels.into_iter().collect::<BTreeSet<_>>(),
    })
}

fn definition_from_row(row: &PgRow) -> StoreResult<OperationDefinition> {
    let spec: Json<DefinitionSpec> = get(row, "spec")?;
    let revision: i32 = get(row, "revision")?;
    Ok(OperationDefinition {
        id: DefinitionId::from_uuid(get(row, "id")?),
        unit: UnitId::from_uuid(get(row, "unit_id")?),
        spec: spec.0,
        revision: revision as u32,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn activity_from_row(row: &PgRow) -> StoreResult<Activity> {
    let kind: String = get(row, "kind")?;
    let state: String = get(row, "state")?;
    let cause: Json<Cause> = get(row, "cause")?;
    let seq: i64 = get(row, "seq")?;
    let delivery: Option<Json<Delivery>> = get(row, "delivery")?;
    let result: Option<Json<ExecutionResult>> = get(row, "result")?;

    Ok(Activity {
        execution_id: ExecutionId::from_uuid(get(row, "execution_id")?),
        host: HostId::from_uuid(get(row, "host_id")?),
        definition_id: DefinitionId::from_uuid(get(row, "definition_id")?),
        definition_title: get(row, "definition_title")?,
        kind: kind.parse::<ActivityKind>().map_err(corrupt_row)?,
        cause: cause.0,
        state: state.parse::<QueueState>().map_err(corrupt_row)?,
        seq: seq as u64,
        created_at: get(row, "created_at")?,
        activated_at: get(row, "activated_at")?,
        finished_at: get(row, "finished_at")?,
        delivery: delivery.map(|d| d.0),
        result: result.map(|r| r.0),
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<ProvisioningStep> {
    let status: String = get(row, "status")?;
    Ok(ProvisioningStep {
        id: StepId::from_uuid(get(row, "id")?),
        workflow_id: WorkflowId::from_uuid(get(row, "workflow_id")?),
        host: HostId::from_uuid(get(row, "host_id")?),
        definition_id: DefinitionId::from_uuid(get(row, "definition_id")?),
        execution_id: ExecutionId::from_uuid(get(row, "execution_id")?),
        status: status.parse::<StepStatus>().map_err(corrupt_row)?,
        updated_at: get(row, "updated_at")?,
    })
}

fn corrupt_row(err: CoreError) -> StoreError {
    StoreError::backend(format!("corrupt row: {err}"))
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique violation, serialization failure, deadlock
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::backend(format!("connection pool closed in {operation}")),
        _ => StoreError::backend(format!("sqlx error in {operation}: {err}")),
    }
}

impl CatalogStore for PostgresFleetStore {
    fn upsert_host(&self, host: Host) -> StoreResult<()> {
        self.block_on(self.upsert_host(host))
    }

    fn host(&self, id: HostId) -> StoreResult<Option<Host>> {
        self.block_on(self.host(id))
    }

    fn insert_definition(
        &self,
        unit: UnitId,
        spec: DefinitionSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<OperationDefinition> {
        self.block_on(self.insert_definition(unit, spec, now))
    }

    fn definition(&self, id: DefinitionId) -> StoreResult<Option<OperationDefinition>> {
        self.block_on(self.definition(id))
    }

    fn definitions(&self, unit: UnitId) -> StoreResult<Vec<OperationDefinition>> {
        self.block_on(self.definitions(unit))
    }

    fn replace_definitions(
        &self,
        unit: UnitId,
        desired: &[DefinitionSpec],
        now: DateTime<Utc>,
    ) -> StoreResult<ReplaceSummary> {
        self.block_on(self.replace_definitions(unit, desired, now))
    }

    fn delete_definition(&self, id: DefinitionId, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        self.block_on(self.delete_definition(id, now))
    }

    fn upsert_rule(&self, rule: AutomationRule) -> StoreResult<()> {
        self.block_on(self.upsert_rule(rule))
    }

    fn rule(&self, id: RuleId) -> StoreResult<Option<AutomationRule>> {
        self.block_on(self.rule(id))
    }

    fn delete_rule(&self, id: RuleId) -> StoreResult<()> {
        self.block_on(self.delete_rule(id))
    }
}

impl ActivityStore for PostgresFleetStore {
    fn enqueue(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Activity> {
        self.block_on(self.enqueue(host, definition, kind, options, now))
    }

    fn enqueue_if_idle(
        &self,
        host: HostId,
        definition: DefinitionId,
        kind: ActivityKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        self.block_on(self.enqueue_if_idle(host, definition, kind, options, now))
    }

    fn activate_next(
        &self,
        host: HostId,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activity>> {
        self.block_on(self.activate_next(host, selector, now))
    }

    fn record_result(
        &self,
        host: HostId,
        execution_id: ExecutionId,
        outcome: ExecutionOutcome,
        selector: &dyn ActivationSelector,
        now: DateTime<Utc>,
    ) -> StoreResult<RecordOutcome> {
        self.block_on(self.record_result(host, execution_id, outcome, selector, now))
    }

    fn cancel(&self, filter: &CancelFilter, now: DateTime<Utc>) -> StoreResult<Vec<ExecutionId>> {
        self.block_on(self.cancel(filter, now))
    }

    fn list_pending(&self, host: HostId) -> StoreResult<Vec<Activity>> {
        self.block_on(self.list_pending(host))
    }

    fn activity(&self, execution_id: ExecutionId) -> StoreResult<Option<Activity>> {
        self.block_on(self.activity(execution_id))
    }

    fn activities_for_definition(&self, definition: DefinitionId) -> StoreResult<Vec<Activity>> {
        self.block_on(self.activities_for_definition(definition))
    }

    fn enqueue_step(
        &self,
        workflow_id: WorkflowId,
        host: HostId,
        definition: DefinitionId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Activity, ProvisioningStep)> {
        self.block_on(self.enqueue_step(workflow_id, host, definition, now))
    }

    fn steps(&self, workflow_id: WorkflowId) -> StoreResult<Vec<ProvisioningStep>> {
        self.block_on(self.steps(workflow_id))
    }

    fn retarget_step(&self, step_id: StepId, now: DateTime<Utc>) -> StoreResult<ProvisioningStep> {
        self.block_on(self.retarget_step(step_id, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_single_flight_index() {
        assert!(SCHEMA.contains("activities_one_active_per_host"));
        assert!(SCHEMA.contains("WHERE state = 'active'"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS deferred_jobs"));
    }

    #[test]
    fn definition_key_is_stable_json() {
        let def = OperationDefinition::new(
            UnitId::global(),
            DefinitionSpec::new("app", "apps", armada_catalog::Payload::script("true")).with_stable_key("k1"),
            Utc::now(),
        );
        assert_eq!(definition_key(&def).unwrap(), r#"{"kind":"stable","value":"k1"}"#);
    }

    #[test]
    fn non_database_errors_are_backend() {
        let err = map_sqlx_error("activate", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
