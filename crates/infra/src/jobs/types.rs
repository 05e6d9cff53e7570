//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use armada_core::CoreError;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a deferred job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `not_before`.
    Queued,
    /// Claimed by a worker under a lease.
    Running,
    Succeeded,
    /// Terminal failure, kept for operators.
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * retry
    Linear,
    /// base * 2^(retry - 1)
    #[default]
    Exponential,
}

/// Retry policy, persisted with the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first failed run (0 = fail on first error).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `retry` (1-indexed), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Whether retry number `retry` (1-indexed) is within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }
}

/// How a failed run should be rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Use the job's retry policy.
    Backoff,
    /// Retry after this delay, still bounded by the retry budget.
    After(Duration),
    /// Terminal failure.
    Never,
}

/// A persisted unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Handler name the executor dispatches on.
    pub name: String,
    pub args: serde_json::Value,
    pub state: JobState,
    /// Failed runs so far.
    pub retries: u32,
    /// Last error text.
    pub error: Option<String>,
    /// Earliest time the job may be claimed.
    pub not_before: DateTime<Utc>,
    pub retry_policy: RetryPolicy,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// The job this one continues, for linked sequences.
    pub previous: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            args,
            state: JobState::Queued,
            retries: 0,
            error: None,
            not_before: now,
            retry_policy: RetryPolicy::default(),
            lease_owner: None,
            lease_expires_at: None,
            previous: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = at;
        self
    }

    /// Schedule the job `delay` after `now`.
    pub fn delayed(self, now: DateTime<Utc>, delay: Duration) -> Self {
        self.not_before(now + chrono_delay(delay))
    }

    pub fn is_due(&self, horizon: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.not_before <= horizon
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn mark_running(&mut self, owner: &str, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(lease_until);
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Succeeded;
        self.release_lease();
        self.updated_at = now;
    }

    /// Record a failed run. Returns `true` when the job was requeued.
    pub fn mark_failed(&mut self, error: impl Into<String>, decision: RetryDecision, now: DateTime<Utc>) -> bool {
        self.retries += 1;
        self.error = Some(error.into());
        self.release_lease();
        self.updated_at = now;

        let delay = match decision {
            RetryDecision::Never => None,
            _ if !self.retry_policy.allows(self.retries) => None,
            RetryDecision::Backoff => Some(self.retry_policy.delay_for(self.retries)),
            RetryDecision::After(delay) => Some(delay),
        };

        match delay {
            Some(delay) => {
                self.state = JobState::Queued;
                self.not_before = now + chrono_delay(delay);
                true
            }
            None => {
                self.state = JobState::Failed;
                false
            }
        }
    }

    /// Operator requeue of a failed job with a fresh retry budget.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Queued;
        self.retries = 0;
        self.not_before = now;
        self.updated_at = now;
    }

    /// Next job of a linked sequence: same name and policy, fresh budget.
    pub fn successor(&self, args: serde_json::Value, not_before: DateTime<Utc>) -> Job {
        Job {
            previous: Some(self.id),
            retry_policy: self.retry_policy.clone(),
            ..Job::new(self.name.clone(), args).not_before(not_before)
        }
    }

    fn release_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Context handed to a handler for one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Clock reading for this run; handlers must not call `Utc::now()`.
    pub now: DateTime<Utc>,
    /// Name of the executor running the job.
    pub worker: String,
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Success,
    /// Retryable failure, rescheduled by the job's retry policy.
    Retry(String),
    /// Retryable failure with an explicit delay.
    RetryAfter { error: String, delay: Duration },
    /// Terminal failure.
    Fail(String),
    /// Finish this job and enqueue its successor atomically.
    Continue { args: serde_json::Value, delay: Duration },
}

impl JobResult {
    /// Map a core error by its handling policy.
    pub fn from_error(err: CoreError) -> Self {
        if err.is_retryable() {
            JobResult::Retry(err.to_string())
        } else {
            JobResult::Fail(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::from_secs(1));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for(3), Duration::from_millis(500));

        let linear = RetryPolicy::linear(5, Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(linear.delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn failure_requeues_until_budget_is_spent() {
        let now = Utc::now();
        let mut job = Job::new("sync", serde_json::json!({}))
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_secs(5)));

        job.mark_running("w1", now, now);
        assert!(job.mark_failed("boom", RetryDecision::Backoff, now));
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retries, 1);
        assert_eq!(job.not_before, now + chrono::Duration::seconds(5));
        assert!(job.lease_owner.is_none());

        job.mark_running("w1", now, now);
        assert!(job.mark_failed("boom", RetryDecision::Backoff, now));

        job.mark_running("w1", now, now);
        assert!(!job.mark_failed("boom", RetryDecision::Backoff, now));
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.retries, 3);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn never_fails_immediately() {
        let now = Utc::now();
        let mut job = Job::new("sync", serde_json::json!({}));
        assert!(!job.mark_failed("unknown handler", RetryDecision::Never, now));
        assert_eq!(job.state, JobState::Failed);
    }

    #[test]
    fn explicit_delay_overrides_policy() {
        let now = Utc::now();
        let mut job = Job::new("sync", serde_json::json!({}));
        assert!(job.mark_failed("later", RetryDecision::After(Duration::from_secs(60)), now));
        assert_eq!(job.not_before, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn successor_links_back() {
        let now = Utc::now();
        let job = Job::new("provisioning", serde_json::json!({"attempt": 0}))
            .with_retry_policy(RetryPolicy::no_retry());
        let next = job.successor(serde_json::json!({"attempt": 1}), now);

        assert_eq!(next.previous, Some(job.id));
        assert_ne!(next.id, job.id);
        assert_eq!(next.name, "provisioning");
        assert_eq!(next.retry_policy, RetryPolicy::no_retry());
        assert_eq!(next.not_before, now);
        assert_eq!(next.state, JobState::Queued);
    }

    #[test]
    fn errors_map_to_results_by_policy() {
        assert!(matches!(
            JobResult::from_error(CoreError::transient("db down")),
            JobResult::Retry(_)
        ));
        assert!(matches!(
            JobResult::from_error(CoreError::not_found("host", "h1")),
            JobResult::Fail(_)
        ));
    }
}
