//! Workflow handlers driven by the deferred job queue.
//!
//! A workflow is a job handler that enqueues host activities and then
//! re-enqueues itself (via `JobResult::Continue`) until what it waits for is
//! observed or it gives up. The workflow instance id travels in the job args,
//! so a sequence survives restarts.

pub mod provisioning;

pub use provisioning::{ProvisioningTask, ProvisioningWorkflow, ReleaseConfig, register};
