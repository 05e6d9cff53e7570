//! Job executor: claims due jobs and dispatches them by name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobContext, JobId, JobResult, JobState, RetryDecision};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job, &JobContext) -> JobResult + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for due jobs
    pub poll_interval: Duration,
    /// Jobs claimed per poll
    pub batch_size: usize,
    /// How long a claimed job stays leased to this executor
    pub lease: Duration,
    /// Lease owner and thread name
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 16,
            lease: Duration::from_secs(300),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    /// Finished and handed over to its successor.
    Continued(JobId),
    /// Failed and requeued.
    Retrying,
    Failed,
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    pub reclaimed: usize,
    pub succeeded: usize,
    pub continued: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Jobs whose outcome could not be stored (lost lease, storage error).
    pub errors: usize,
}

impl CycleReport {
    pub fn executed(&self) -> usize {
        self.succeeded + self.continued + self.retrying + self.failed
    }

    fn record(&mut self, execution: Execution) {
        match execution {
            Execution::Succeeded => self.succeeded += 1,
            Execution::Continued(_) => self.continued += 1,
            Execution::Retrying => self.retrying += 1,
            Execution::Failed => self.failed += 1,
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the current cycle to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub cycles: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_reclaimed: u64,
    pub job_errors: u64,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.jobs_processed += report.executed() as u64;
        self.jobs_succeeded += (report.succeeded + report.continued) as u64;
        self.jobs_retried += report.retrying as u64;
        self.jobs_failed += report.failed as u64;
        self.jobs_reclaimed += report.reclaimed as u64;
        self.job_errors += report.errors as u64;
    }
}

/// Background job executor.
///
/// Each cycle reclaims expired leases, claims due jobs and runs them through
/// the handler registered under the job's name. Unknown names fail the job
/// terminally.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
    config: JobExecutorConfig,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            config: JobExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register the handler for jobs named `name`.
    pub fn register_handler<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Job, &JobContext) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(mut self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        self.config = config;
        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || executor_loop(self, shutdown_rx, stats_clone))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Run one poll cycle at `now`.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<CycleReport, JobStoreError> {
        let mut report = CycleReport::default();

        let reclaimed = self.store.reclaim_expired(now)?;
        if !reclaimed.is_empty() {
            warn!(
                executor = %self.config.name,
                count = reclaimed.len(),
                "reclaimed jobs with expired leases"
            );
        }
        report.reclaimed = reclaimed.len();

        let claimed = self
            .store
            .claim_due(self.config.batch_size, now, &self.config.name, self.config.lease)?;

        for job in &claimed {
            debug!(executor = %self.config.name, job_id = %job.id, name = %job.name, "claimed job");
            match self.execute(job, now) {
                Ok(execution) => report.record(execution),
                Err(e) => {
                    report.errors += 1;
                    error!(
                        executor = %self.config.name,
                        job_id = %job.id,
                        name = %job.name,
                        error = %e,
                        "failed to record job outcome"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Execute one claimed job and record its outcome under this executor's
    /// lease.
    pub fn execute(&self, job: &Job, now: DateTime<Utc>) -> Result<Execution, JobStoreError> {
        let Some(handler) = self.handlers.get(&job.name) else {
            let error = format!("no handler registered for job name: {}", job.name);
            warn!(job_id = %job.id, name = %job.name, "no handler for job");
            self.store
                .fail(job.id, &self.config.name, &error, RetryDecision::Never, now)?;
            return Ok(Execution::Failed);
        };

        let ctx = JobContext {
            now,
            worker: self.config.name.clone(),
        };

        let execution = match handler(job, &ctx) {
            JobResult::Success => {
                self.store.complete(job.id, &self.config.name, now)?;
                Execution::Succeeded
            }
            JobResult::Continue { args, delay } => {
                let successor = job.successor(args, now).delayed(now, delay);
                let next = self.store.continue_with(job.id, &self.config.name, successor, now)?;
                debug!(job_id = %job.id, next_job_id = %next, "job continued");
                Execution::Continued(next)
            }
            JobResult::Retry(error) => self.fail(job, &error, RetryDecision::Backoff, now)?,
            JobResult::RetryAfter { error, delay } => self.fail(job, &error, RetryDecision::After(delay), now)?,
            JobResult::Fail(error) => self.fail(job, &error, RetryDecision::Never, now)?,
        };
        Ok(execution)
    }

    fn fail(
        &self,
        job: &Job,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<Execution, JobStoreError> {
        let updated = self.store.fail(job.id, &self.config.name, error, decision, now)?;
        if updated.state == JobState::Queued {
            debug!(
                job_id = %job.id,
                retries = updated.retries,
                not_before = %updated.not_before,
                error = %error,
                "job failed, retrying"
            );
            Ok(Execution::Retrying)
        } else {
            warn!(job_id = %job.id, retries = updated.retries, error = %error, "job failed permanently");
            Ok(Execution::Failed)
        }
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: JobExecutor<S>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    let name = executor.config.name.clone();
    info!(executor = %name, "job executor started");
    let start_time = Instant::now();

    loop {
        match executor.run_once(Utc::now()) {
            Ok(report) => {
                if let Ok(mut s) = stats.lock() {
                    s.absorb(&report);
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
                // A full batch means more work may be due right away.
                if report.executed() >= executor.config.batch_size && executor.config.batch_size > 0 {
                    if shutdown_requested(&shutdown_rx) {
                        break;
                    }
                    continue;
                }
            }
            Err(e) => {
                error!(executor = %name, error = %e, "job poll cycle failed");
            }
        }

        match shutdown_rx.recv_timeout(executor.config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(executor = %name, "job executor stopped");
}

fn shutdown_requested(rx: &mpsc::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, JobStats};
    use crate::jobs::types::RetryPolicy;

    fn executor() -> (Arc<InMemoryJobStore>, JobExecutor<Arc<InMemoryJobStore>>) {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(store.clone()).with_config(JobExecutorConfig::default().with_name("test"));
        (store, executor)
    }

    #[test]
    fn successful_job_is_completed() {
        let (store, mut executor) = executor();
        executor.register_handler("echo", |_job, _ctx| JobResult::Success);

        let now = Utc::now();
        let id = store.enqueue(Job::new("echo", serde_json::json!({})).not_before(now)).unwrap();

        let report = executor.run_once(now).unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(store.get(id).unwrap().unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn unknown_name_is_terminal() {
        let (store, executor) = executor();
        let now = Utc::now();
        let id = store
            .enqueue(Job::new("removed-handler", serde_json::json!({})).not_before(now))
            .unwrap();

        let report = executor.run_once(now).unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("removed-handler"));
    }

    #[test]
    fn retryable_failure_is_rescheduled_then_exhausted() {
        let (store, mut executor) = executor();
        executor.register_handler("flaky", |_job, _ctx| JobResult::Retry("timeout".into()));

        let now = Utc::now();
        let id = store
            .enqueue(
                Job::new("flaky", serde_json::json!({}))
                    .not_before(now)
                    .with_retry_policy(RetryPolicy::fixed(1, Duration::from_secs(10))),
            )
            .unwrap();

        assert_eq!(executor.run_once(now).unwrap().retrying, 1);
        // Not due yet.
        assert_eq!(executor.run_once(now).unwrap().executed(), 0);

        let later = now + chrono::Duration::seconds(10);
        assert_eq!(executor.run_once(later).unwrap().failed, 1);
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.retries, 2);
    }

    #[test]
    fn continue_enqueues_successor_with_delay() {
        let (store, mut executor) = executor();
        executor.register_handler("chain", |job, _ctx| {
            let n = job.args["n"].as_u64().unwrap_or(0);
            if n < 2 {
                JobResult::Continue {
                    args: serde_json::json!({ "n": n + 1 }),
                    delay: Duration::from_secs(5),
                }
            } else {
                JobResult::Success
            }
        });

        let now = Utc::now();
        store
            .enqueue(Job::new("chain", serde_json::json!({"n": 0})).not_before(now))
            .unwrap();

        assert_eq!(executor.run_once(now).unwrap().continued, 1);
        assert_eq!(executor.run_once(now).unwrap().executed(), 0);
        assert_eq!(
            executor.run_once(now + chrono::Duration::seconds(5)).unwrap().continued,
            1
        );
        assert_eq!(
            executor.run_once(now + chrono::Duration::seconds(10)).unwrap().succeeded,
            1
        );

        let stats = store.stats().unwrap();
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.queued, 0);
    }

    #[test]
    fn handler_sees_cycle_clock() {
        let (store, mut executor) = executor();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        executor.register_handler("clock", move |_job, ctx| {
            *sink.lock().unwrap() = Some((ctx.now, ctx.worker.clone()));
            JobResult::Success
        });

        let now = Utc::now();
        store.enqueue(Job::new("clock", serde_json::json!({})).not_before(now)).unwrap();
        executor.run_once(now).unwrap();

        assert_eq!(*seen.lock().unwrap(), Some((now, "test".to_string())));
    }

    #[test]
    fn spawned_executor_drains_queue_and_shuts_down() {
        let (store, mut executor) = executor();
        executor.register_handler("echo", |_job, _ctx| JobResult::Success);
        for _ in 0..3 {
            store
                .enqueue(Job::new("echo", serde_json::json!({})).not_before(Utc::now()))
                .unwrap();
        }

        let config = JobExecutorConfig {
            poll_interval: Duration::from_millis(10),
            ..JobExecutorConfig::default()
        };
        let handle = executor.spawn(config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.stats().unwrap().succeeded < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.stats().jobs_succeeded <= 3);
        handle.shutdown();
        assert_eq!(store.stats().unwrap().succeeded, 3);
    }

    /// Refuses to complete one job, as a store that lost its connection would.
    struct FailingComplete {
        inner: InMemoryJobStore,
        broken: Mutex<Option<JobId>>,
    }

    impl JobStore for FailingComplete {
        fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
            self.inner.enqueue(job)
        }
        fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(id)
        }
        fn claim_due(
            &self,
            limit: usize,
            horizon: DateTime<Utc>,
            owner: &str,
            lease: Duration,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.claim_due(limit, horizon, owner, lease)
        }
        fn complete(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
            if *self.broken.lock().unwrap() == Some(id) {
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.complete(id, owner, now)
        }
        fn fail(
            &self,
            id: JobId,
            owner: &str,
            error: &str,
            decision: RetryDecision,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            self.inner.fail(id, owner, error, decision, now)
        }
        fn continue_with(
            &self,
            id: JobId,
            owner: &str,
            successor: Job,
            now: DateTime<Utc>,
        ) -> Result<JobId, JobStoreError> {
            self.inner.continue_with(id, owner, successor, now)
        }
        fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
            self.inner.reclaim_expired(now)
        }
        fn requeue_failed(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
            self.inner.requeue_failed(id, now)
        }
        fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(state, limit)
        }
        fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats()
        }
    }

    #[test]
    fn store_error_on_one_job_does_not_strand_the_batch() {
        let store = Arc::new(FailingComplete {
            inner: InMemoryJobStore::new(),
            broken: Mutex::new(None),
        });
        let mut executor = JobExecutor::new(store.clone()).with_config(JobExecutorConfig::default().with_name("test"));
        executor.register_handler("echo", |_job, _ctx| JobResult::Success);

        let now = Utc::now();
        let ids: Vec<JobId> = (0..3)
            .map(|i| {
                let job = Job::new("echo", serde_json::json!({ "i": i }))
                    .not_before(now - chrono::Duration::seconds(3 - i));
                store.enqueue(job).unwrap()
            })
            .collect();
        *store.broken.lock().unwrap() = Some(ids[0]);

        let report = executor.run_once(now).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.succeeded, 2);

        assert_eq!(store.get(ids[0]).unwrap().unwrap().state, JobState::Running);
        assert_eq!(store.get(ids[1]).unwrap().unwrap().state, JobState::Succeeded);
        assert_eq!(store.get(ids[2]).unwrap().unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn late_report_after_reclaim_is_rejected() {
        let store = InMemoryJobStore::arc();
        let lease = Duration::from_secs(30);
        let now = Utc::now();
        let id = store.enqueue(Job::new("slow", serde_json::json!({})).not_before(now)).unwrap();

        // "slow" reports only after its lease ran out and a peer took the job.
        let mut slow = JobExecutor::new(store.clone())
            .with_config(JobExecutorConfig::default().with_name("slow").with_lease(lease));
        let peer_store = store.clone();
        slow.register_handler("slow", move |job, ctx| {
            let late = ctx.now + chrono::Duration::seconds(31);
            peer_store.reclaim_expired(late).unwrap();
            let retry_at = peer_store.get(job.id).unwrap().unwrap().not_before.max(late);
            assert_eq!(peer_store.claim_due(1, retry_at, "peer", lease).unwrap().len(), 1);
            JobResult::Success
        });

        let report = slow.run_once(now).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.succeeded, 0);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.lease_owner.as_deref(), Some("peer"));
        assert_eq!(job.retries, 1);
    }
}
