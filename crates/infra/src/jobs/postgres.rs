//! Postgres-backed job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so concurrent executors never block
//! on each other's rows and never claim the same job twice. State changes on
//! a claimed job lock the row, apply the same `Job` transition the in-memory
//! store uses, and write it back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};
use uuid::Uuid;

use super::store::{JobStats, JobStore, JobStoreError, expect_lease, expect_state};
use super::types::{Job, JobId, JobState, RetryDecision, RetryPolicy, chrono_delay};

const JOB_COLUMNS: &str = "id, name, args, state, retries, error, not_before, retry_policy, \
     lease_owner, lease_expires_at, previous, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, name = %job.name), err)]
    pub async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut tx = self.begin().await?;
        insert_job(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job.id)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM deferred_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(claimed = field::Empty), err)]
    pub async fn claim_due(
        &self,
        limit: usize,
        horizon: DateTime<Utc>,
        owner: &str,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE deferred_jobs
            SET state = 'running', lease_owner = $3, lease_expires_at = $4, updated_at = $1
            WHERE id IN (
                SELECT id FROM deferred_jobs
                WHERE state = 'queued' AND not_before <= $1
                ORDER BY not_before, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(horizon)
            .bind(limit as i64)
            .bind(owner)
            .bind(horizon + chrono_delay(lease))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut jobs: Vec<Job> = rows.iter().map(job_from_row).collect::<Result<_, _>>()?;
        jobs.sort_by_key(|j| (j.not_before, j.created_at));
        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn complete(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_leased_job(&mut tx, id, owner, now).await?;
        job.mark_succeeded(now);
        save_job(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    pub async fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_leased_job(&mut tx, id, owner, now).await?;
        job.mark_failed(error, decision, now);
        save_job(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self, successor), fields(job_id = %id, next_job_id = %successor.id), err)]
    pub async fn continue_with(
        &self,
        id: JobId,
        owner: &str,
        successor: Job,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_leased_job(&mut tx, id, owner, now).await?;
        job.mark_succeeded(now);
        save_job(&mut tx, &job).await?;
        insert_job(&mut tx, &successor).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(successor.id)
    }

    #[instrument(skip(self), fields(reclaimed = field::Empty), err)]
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let mut tx = self.begin().await?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM deferred_jobs
            WHERE state = 'running' AND lease_expires_at < $1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            job.mark_failed("lease expired", RetryDecision::Backoff, now);
            save_job(&mut tx, &job).await?;
            reclaimed.push(job.id);
        }
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;

        reclaimed.sort();
        Span::current().record("reclaimed", reclaimed.len());
        Ok(reclaimed)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn requeue_failed(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        expect_state(&job, JobState::Failed)?;
        job.requeue(now);
        save_job(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    pub async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM deferred_jobs
            WHERE $1::TEXT IS NULL OR state = $1
            ORDER BY created_at, id
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(state.map(JobState::as_str))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM deferred_jobs GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in &rows {
            let state: String = get(row, "state")?;
            let n: i64 = get(row, "n")?;
            stats.count(parse_state(&state)?, n as usize);
        }
        Ok(stats)
    }
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, id: JobId) -> Result<Job, JobStoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM deferred_jobs WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
    match row {
        Some(row) => job_from_row(&row),
        None => Err(JobStoreError::NotFound(id)),
    }
}

/// Lock a running job still leased to `owner`. The owner and expiry are
/// matched in the locking query; a miss is resolved to `NotFound`,
/// `InvalidState` or `LeaseLost` from the current row.
async fn lock_leased_job(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<Job, JobStoreError> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS} FROM deferred_jobs
        WHERE id = $1 AND state = 'running' AND lease_owner = $2 AND lease_expires_at >= $3
        FOR UPDATE
        "#
    );
    let row = sqlx::query(&sql)
        .bind(id.0)
        .bind(owner)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_leased_job", e))?;
    if let Some(row) = row {
        return job_from_row(&row);
    }
    let job = lock_job(tx, id).await?;
    expect_lease(&job, owner, now)?;
    Err(JobStoreError::LeaseLost {
        id,
        owner: owner.to_string(),
    })
}

async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    let sql = format!(
        "INSERT INTO deferred_jobs ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    );
    sqlx::query(&sql)
        .bind(job.id.0)
        .bind(&job.name)
        .bind(Json(&job.args))
        .bind(job.state.as_str())
        .bind(job.retries as i32)
        .bind(job.error.as_deref())
        .bind(job.not_before)
        .bind(Json(&job.retry_policy))
        .bind(job.lease_owner.as_deref())
        .bind(job.lease_expires_at)
        .bind(job.previous.map(|p| p.0))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| match map_sqlx_error("insert_job", e) {
            JobStoreError::Conflict(_) => JobStoreError::AlreadyExists(job.id),
            other => other,
        })?;
    Ok(())
}

async fn save_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE deferred_jobs
        SET state = $2, retries = $3, error = $4, not_before = $5,
            lease_owner = $6, lease_expires_at = $7, updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(job.id.0)
    .bind(job.state.as_str())
    .bind(job.retries as i32)
    .bind(job.error.as_deref())
    .bind(job.not_before)
    .bind(job.lease_owner.as_deref())
    .bind(job.lease_expires_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("save_job", e))?;
    Ok(())
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, JobStoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| JobStoreError::Storage(format!("failed to read column {column}: {e}")))
}

fn parse_state(s: &str) -> Result<JobState, JobStoreError> {
    s.parse().map_err(JobStoreError::Storage)
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let state: String = get(row, "state")?;
    let retries: i32 = get(row, "retries")?;
    let args: Json<serde_json::Value> = get(row, "args")?;
    let retry_policy: Json<RetryPolicy> = get(row, "retry_policy")?;
    let previous: Option<Uuid> = get(row, "previous")?;

    Ok(Job {
        id: JobId::from_uuid(get(row, "id")?),
        name: get(row, "name")?,
        args: args.0,
        state: parse_state(&state)?,
        retries: retries.max(0) as u32,
        error: get(row, "error")?,
        not_before: get(row, "not_before")?,
        retry_policy: retry_policy.0,
        lease_owner: get(row, "lease_owner")?,
        lease_expires_at: get(row, "lease_expires_at")?,
        previous: previous.map(JobId::from_uuid),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            if db_err.code().as_deref() == Some("23505") {
                JobStoreError::Conflict(msg)
            } else {
                JobStoreError::Storage(msg)
            }
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {operation}")),
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

impl JobStore for PostgresJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.runtime.block_on(self.enqueue(job))
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.runtime.block_on(self.get(id))
    }

    fn claim_due(
        &self,
        limit: usize,
        horizon: DateTime<Utc>,
        owner: &str,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.runtime.block_on(self.claim_due(limit, horizon, owner, lease))
    }

    fn complete(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        self.runtime.block_on(self.complete(id, owner, now))
    }

    fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.runtime.block_on(self.fail(id, owner, error, decision, now))
    }

    fn continue_with(
        &self,
        id: JobId,
        owner: &str,
        successor: Job,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobStoreError> {
        self.runtime.block_on(self.continue_with(id, owner, successor, now))
    }

    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        self.runtime.block_on(self.reclaim_expired(now))
    }

    fn requeue_failed(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        self.runtime.block_on(self.requeue_failed(id, now))
    }

    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.runtime.block_on(self.list(state, limit))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.runtime.block_on(self.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pool_is_storage_error() {
        let err = map_sqlx_error("claim_due", sqlx::Error::PoolClosed);
        assert!(matches!(err, JobStoreError::Storage(_)));
    }

    #[test]
    fn unknown_state_is_storage_error() {
        assert!(matches!(parse_state("dead_lettered"), Err(JobStoreError::Storage(_))));
        assert_eq!(parse_state("running").unwrap(), JobState::Running);
    }
}
