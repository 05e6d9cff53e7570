//! Deferred job queue: durable, named, retryable background tasks.
//!
//! ## Design
//!
//! - Jobs are claimed under a lease (`claim_due`) so at most one worker runs
//!   a job at a time; `reclaim_expired` recovers jobs of crashed workers
//! - Only the current lease holder can complete, fail or continue a job; a
//!   worker that reports after its lease expired gets `LeaseLost`
//! - Retryable failures are rescheduled with the job's own `RetryPolicy`
//! - Terminal failures stay in the table as `Failed` for operators
//! - Multi-step workflows chain jobs with `continue_with`, which links the
//!   successor through `previous`
//!
//! ## Components
//!
//! - `Job`: job row with name, JSON args and scheduling fields
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobExecutor`: poll loop dispatching by exact job name

pub mod executor;
pub mod postgres;
pub mod store;
pub mod types;

pub use executor::{CycleReport, Execution, ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{BackoffStrategy, Job, JobContext, JobId, JobResult, JobState, RetryDecision, RetryPolicy};
