//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use armada_core::CoreError;

use super::types::{Job, JobId, JobState, RetryDecision, chrono_delay};

/// Durable table of deferred jobs.
///
/// Every method is atomic with respect to the others. At most one worker
/// holds a job in `Running` at a time; leases bound how long a crashed
/// worker can keep it.
pub trait JobStore: Send + Sync {
    /// Enqueue a new job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Move up to `limit` queued jobs with `not_before <= horizon` to
    /// `Running`, leased to `owner` for `lease`. Oldest `not_before` first.
    fn claim_due(
        &self,
        limit: usize,
        horizon: DateTime<Utc>,
        owner: &str,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Mark a running job leased to `owner` as succeeded.
    ///
    /// `complete`, `fail` and `continue_with` reject an `owner` whose lease
    /// expired or was handed to another worker with `LeaseLost`.
    fn complete(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Record a failed run of a running job; requeues it when `decision` and
    /// the retry budget allow.
    fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Mark a running job as succeeded and enqueue `successor` in the same step.
    fn continue_with(
        &self,
        id: JobId,
        owner: &str,
        successor: Job,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobStoreError>;

    /// Return running jobs whose lease expired to the queue (counting a
    /// retry), or fail them when the budget is spent.
    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError>;

    /// Put a failed job back in the queue with a fresh retry budget.
    fn requeue_failed(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Jobs in `state` (all when `None`), oldest first.
    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {state}, expected {expected}")]
    InvalidState {
        id: JobId,
        state: &'static str,
        expected: &'static str,
    },
    #[error("job {id} is no longer leased to {owner}")]
    LeaseLost { id: JobId, owner: String },
    #[error("job storage conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for CoreError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => CoreError::not_found("job", id),
            JobStoreError::AlreadyExists(id) => CoreError::conflict(format!("job already exists: {id}")),
            e @ (JobStoreError::InvalidState { .. } | JobStoreError::LeaseLost { .. }) => {
                CoreError::precondition(e.to_string())
            }
            JobStoreError::Conflict(msg) => CoreError::Conflict(msg),
            JobStoreError::Storage(msg) => CoreError::Transient(msg),
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Queued => self.queued += n,
            JobState::Running => self.running += n,
            JobState::Succeeded => self.succeeded += n,
            JobState::Failed => self.failed += n,
        }
    }
}

pub(crate) fn expect_state(job: &Job, expected: JobState) -> Result<(), JobStoreError> {
    if job.state == expected {
        Ok(())
    } else {
        Err(JobStoreError::InvalidState {
            id: job.id,
            state: job.state.as_str(),
            expected: expected.as_str(),
        })
    }
}

/// A job may only leave `Running` through the worker that still holds an
/// unexpired lease on it.
pub(crate) fn expect_lease(job: &Job, owner: &str, now: DateTime<Utc>) -> Result<(), JobStoreError> {
    expect_state(job, JobState::Running)?;
    if job.lease_owner.as_deref() != Some(owner) || job.lease_expired(now) {
        return Err(JobStoreError::LeaseLost {
            id: job.id,
            owner: owner.to_string(),
        });
    }
    Ok(())
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }
}

fn leased<'a>(
    jobs: &'a mut HashMap<JobId, Job>,
    id: JobId,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<&'a mut Job, JobStoreError> {
    let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
    expect_lease(job, owner, now)?;
    Ok(job)
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn claim_due(
        &self,
        limit: usize,
        horizon: DateTime<Utc>,
        owner: &str,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.write()?;

        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_due(horizon))
            .map(|j| (j.not_before, j.created_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let lease_until = horizon + chrono_delay(lease);
        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_running(owner, lease_until, horizon);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    fn complete(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = leased(&mut jobs, id, owner, now)?;
        job.mark_succeeded(now);
        Ok(job.clone())
    }

    fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = leased(&mut jobs, id, owner, now)?;
        job.mark_failed(error, decision, now);
        Ok(job.clone())
    }

    fn continue_with(
        &self,
        id: JobId,
        owner: &str,
        successor: Job,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&successor.id) {
            return Err(JobStoreError::AlreadyExists(successor.id));
        }
        leased(&mut jobs, id, owner, now)?.mark_succeeded(now);
        let next = successor.id;
        jobs.insert(next, successor);
        Ok(next)
    }

    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.write()?;
        let mut reclaimed: Vec<JobId> = jobs
            .values_mut()
            .filter(|j| j.lease_expired(now))
            .map(|j| {
                j.mark_failed("lease expired", RetryDecision::Backoff, now);
                j.id
            })
            .collect();
        reclaimed.sort();
        Ok(reclaimed)
    }

    fn requeue_failed(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        expect_state(job, JobState::Failed)?;
        job.requeue(now);
        Ok(job.clone())
    }

    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.state, 1);
        }
        Ok(stats)
    }
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn claim_due(
        &self,
        limit: usize,
        horizon: DateTime<Utc>,
        owner: &str,
        lease: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_due(limit, horizon, owner, lease)
    }

    fn complete(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).complete(id, owner, now)
    }

    fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).fail(id, owner, error, decision, now)
    }

    fn continue_with(
        &self,
        id: JobId,
        owner: &str,
        successor: Job,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobStoreError> {
        (**self).continue_with(id, owner, successor, now)
    }

    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        (**self).reclaim_expired(now)
    }

    fn requeue_failed(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).requeue_failed(id, now)
    }

    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(state, limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::RetryPolicy;

    const LEASE: Duration = Duration::from_secs(30);

    #[test]
    fn claims_only_due_jobs_in_order() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let later = store
            .enqueue(Job::new("a", serde_json::json!({})).not_before(now + chrono::Duration::seconds(60)))
            .unwrap();
        let second = store
            .enqueue(Job::new("b", serde_json::json!({})).not_before(now - chrono::Duration::seconds(1)))
            .unwrap();
        let first = store
            .enqueue(Job::new("c", serde_json::json!({})).not_before(now - chrono::Duration::seconds(5)))
            .unwrap();

        let claimed = store.claim_due(10, now, "w1", LEASE).unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(claimed.iter().all(|j| j.state == JobState::Running));
        assert_eq!(claimed[0].lease_owner.as_deref(), Some("w1"));

        // Already running jobs are not claimed twice.
        assert!(store.claim_due(10, now, "w2", LEASE).unwrap().is_empty());
        assert_eq!(store.get(later).unwrap().unwrap().state, JobState::Queued);
    }

    #[test]
    fn claim_respects_limit() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for i in 0..5 {
            store
                .enqueue(Job::new("a", serde_json::json!({"i": i})).not_before(now))
                .unwrap();
        }
        assert_eq!(store.claim_due(2, now, "w1", LEASE).unwrap().len(), 2);
        assert_eq!(store.stats().unwrap().running, 2);
        assert_eq!(store.stats().unwrap().queued, 3);
    }

    #[test]
    fn complete_requires_running() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(Job::new("a", serde_json::json!({}))).unwrap();
        assert!(matches!(
            store.complete(id, "w1", Utc::now()),
            Err(JobStoreError::InvalidState { .. })
        ));
        assert!(matches!(
            store.complete(JobId::new(), "w1", Utc::now()),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn expired_leases_are_reclaimed() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store
            .enqueue(
                Job::new("a", serde_json::json!({}))
                    .not_before(now)
                    .with_retry_policy(RetryPolicy::fixed(1, Duration::from_secs(1))),
            )
            .unwrap();

        store.claim_due(1, now, "crashed", LEASE).unwrap();
        assert!(store.reclaim_expired(now).unwrap().is_empty());

        let after_lease = now + chrono::Duration::seconds(31);
        assert_eq!(store.reclaim_expired(after_lease).unwrap(), vec![id]);
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retries, 1);
        assert!(job.lease_owner.is_none());

        // Second expiry exhausts the budget.
        store.claim_due(1, after_lease + chrono::Duration::seconds(5), "crashed", LEASE).unwrap();
        let much_later = after_lease + chrono::Duration::seconds(120);
        store.reclaim_expired(much_later).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn continue_with_is_atomic() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(Job::new("flow", serde_json::json!({"attempt": 0})).not_before(now)).unwrap();
        let job = store.claim_due(1, now, "w1", LEASE).unwrap().remove(0);

        let successor = job.successor(serde_json::json!({"attempt": 1}), now);
        let next = store.continue_with(id, "w1", successor.clone(), now).unwrap();

        assert_eq!(store.get(id).unwrap().unwrap().state, JobState::Succeeded);
        let stored = store.get(next).unwrap().unwrap();
        assert_eq!(stored.previous, Some(id));

        // The predecessor is no longer running, so a replay fails without
        // inserting a second successor.
        let replay = job.successor(serde_json::json!({"attempt": 1}), now);
        assert!(store.continue_with(id, "w1", replay, now).is_err());
        assert_eq!(store.list(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn failed_jobs_can_be_requeued() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(Job::new("a", serde_json::json!({})).not_before(now)).unwrap();
        store.claim_due(1, now, "w1", LEASE).unwrap();
        let failed = store.fail(id, "w1", "unknown handler", RetryDecision::Never, now).unwrap();
        assert_eq!(failed.state, JobState::Failed);

        let listed = store.list(Some(JobState::Failed), 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].error.as_deref(), Some("unknown handler"));

        let requeued = store.requeue_failed(id, now).unwrap();
        assert_eq!(requeued.state, JobState::Queued);
        assert_eq!(requeued.retries, 0);
        assert!(store.requeue_failed(id, now).is_err());
    }

    #[test]
    fn stale_owner_is_fenced_after_reclaim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(Job::new("a", serde_json::json!({})).not_before(now)).unwrap();
        store.claim_due(1, now, "w1", LEASE).unwrap();

        let after_lease = now + chrono::Duration::seconds(31);
        assert_eq!(store.reclaim_expired(after_lease).unwrap(), vec![id]);
        let retry_at = store.get(id).unwrap().unwrap().not_before.max(after_lease);
        assert_eq!(store.claim_due(1, retry_at, "w2", LEASE).unwrap().len(), 1);

        // w1 finishes late: every transition is rejected and w2 keeps the job.
        assert!(matches!(
            store.complete(id, "w1", retry_at),
            Err(JobStoreError::LeaseLost { ref owner, .. }) if owner == "w1"
        ));
        assert!(matches!(
            store.fail(id, "w1", "boom", RetryDecision::Never, retry_at),
            Err(JobStoreError::LeaseLost { .. })
        ));
        let successor = Job::new("a", serde_json::json!({}));
        assert!(matches!(
            store.continue_with(id, "w1", successor, retry_at),
            Err(JobStoreError::LeaseLost { .. })
        ));
        assert_eq!(store.list(None, 10).unwrap().len(), 1);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.lease_owner.as_deref(), Some("w2"));
        assert_eq!(store.complete(id, "w2", retry_at).unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn expired_lease_is_rejected_before_reclaim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(Job::new("a", serde_json::json!({})).not_before(now)).unwrap();
        store.claim_due(1, now, "w1", LEASE).unwrap();

        let late = now + chrono::Duration::seconds(31);
        assert!(matches!(store.complete(id, "w1", late), Err(JobStoreError::LeaseLost { .. })));
        assert_eq!(store.get(id).unwrap().unwrap().state, JobState::Running);
        assert_eq!(store.reclaim_expired(late).unwrap(), vec![id]);
    }
}
