//! Post-enrollment provisioning and the escalating "release device" wait.
//!
//! ```text
//! start ──► PostEnrollment ──Continue(initial_delay)──► ReleaseDevice(attempt 0)
//!                                                          │
//!          ┌── not ready, not timed out: Continue(retry_delay, attempt + 1)
//!          └── ready or timed out: enqueue release command, Success
//! ```
//!
//! `started_at` is fixed by the first `ReleaseDevice` run and carried forward
//! unchanged, so the give-up deadline does not move with retries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use armada_activities::{ActivityKind, EnqueueOptions, QueueState, StepStatus};
use armada_core::{CoreError, CoreResult, DefinitionId, ExecutionId, HostId, WorkflowId};

use crate::jobs::types::chrono_delay;
use crate::jobs::{Job, JobContext, JobExecutor, JobId, JobResult, JobStore};
use crate::queue::ActivityQueue;
use crate::store::{ActivityStore, CatalogStore, FleetStore};

/// Job name the workflow is registered under.
pub const JOB_NAME: &str = "provisioning";

/// Timing of the release wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseConfig {
    /// Delay between post-enrollment and the first release check.
    pub initial_delay: Duration,
    /// Delay between release checks.
    pub retry_delay: Duration,
    /// Release unconditionally once this much time passed since the first check.
    pub max_wait: Duration,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            retry_delay: Duration::from_secs(30),
            max_wait: Duration::from_secs(15 * 60),
        }
    }
}

/// Job args of the provisioning workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ProvisioningTask {
    PostEnrollment {
        host: HostId,
        workflow_id: WorkflowId,
        release_automatically: bool,
    },
    ReleaseDevice {
        host: HostId,
        workflow_id: WorkflowId,
        #[serde(default)]
        attempt: u32,
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
        /// Activity whose acknowledgment gates the release.
        #[serde(default)]
        awaited: Option<ExecutionId>,
    },
}

impl ProvisioningTask {
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            ProvisioningTask::PostEnrollment { workflow_id, .. } | ProvisioningTask::ReleaseDevice { workflow_id, .. } => {
                *workflow_id
            }
        }
    }

    pub fn to_args(&self) -> CoreResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| CoreError::terminal(format!("unencodable provisioning task: {e}")))
    }
}

/// Provisioning workflow for newly enrolled hosts.
pub struct ProvisioningWorkflow<S: FleetStore, J: JobStore> {
    queue: ActivityQueue<S>,
    jobs: J,
    release_command: DefinitionId,
    bootstrap_command: Option<DefinitionId>,
    config: ReleaseConfig,
}

impl<S: FleetStore, J: JobStore> ProvisioningWorkflow<S, J> {
    /// `release_command` must be a command definition; it is enqueued when
    /// the device is released.
    pub fn new(queue: ActivityQueue<S>, jobs: J, release_command: DefinitionId, config: ReleaseConfig) -> Self {
        Self {
            queue,
            jobs,
            release_command,
            bootstrap_command: None,
            config,
        }
    }

    /// Enqueue `command` first and wait for its acknowledgment before release.
    pub fn with_bootstrap(mut self, command: DefinitionId) -> Self {
        self.bootstrap_command = Some(command);
        self
    }

    pub fn queue(&self) -> &ActivityQueue<S> {
        &self.queue
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    /// Enqueue the post-enrollment job for `host`.
    #[instrument(skip(self), fields(host_id = %host))]
    pub fn start(&self, host: HostId, release_automatically: bool, now: DateTime<Utc>) -> CoreResult<(WorkflowId, JobId)> {
        if self.queue.store().host(host)?.is_none() {
            return Err(CoreError::not_found("host", host));
        }
        let workflow_id = WorkflowId::new();
        let task = ProvisioningTask::PostEnrollment {
            host,
            workflow_id,
            release_automatically,
        };
        let job_id = self.jobs.enqueue(Job::new(JOB_NAME, task.to_args()?).not_before(now))?;
        info!(workflow_id = %workflow_id, job_id = %job_id, "provisioning started");
        Ok((workflow_id, job_id))
    }

    /// Job handler entry point.
    pub fn handle(&self, job: &Job, ctx: &JobContext) -> JobResult {
        let task: ProvisioningTask = match serde_json::from_value(job.args.clone()) {
            Ok(task) => task,
            Err(e) => return JobResult::Fail(format!("malformed provisioning task: {e}")),
        };

        let result = match task {
            ProvisioningTask::PostEnrollment {
                host,
                workflow_id,
                release_automatically,
            } => self.post_enrollment(host, workflow_id, release_automatically, ctx.now),
            ProvisioningTask::ReleaseDevice {
                host,
                workflow_id,
                attempt,
                started_at,
                awaited,
            } => self.release_device(host, workflow_id, attempt, started_at, awaited, ctx.now),
        };
        result.unwrap_or_else(JobResult::from_error)
    }

    #[instrument(skip(self), fields(host_id = %host_id, workflow_id = %workflow_id))]
    fn post_enrollment(
        &self,
        host_id: HostId,
        workflow_id: WorkflowId,
        release_automatically: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<JobResult> {
        let store = self.queue.store();
        let host = store.host(host_id)?.ok_or_else(|| CoreError::not_found("host", host_id))?;

        let awaited = match self.bootstrap_command {
            Some(command) => Some(self.enqueue_command(host_id, workflow_id, command, now)?),
            None => None,
        };

        // A retried run must not duplicate steps it already created.
        let existing: HashSet<DefinitionId> = store.steps(workflow_id)?.iter().map(|s| s.definition_id).collect();
        let mut steps = 0;
        for definition in store.definitions(host.unit)? {
            if !definition.spec.required_for_provisioning
                || !definition.spec.audience.matches(&host.labels)
                || existing.contains(&definition.id)
            {
                continue;
            }
            store.enqueue_step(workflow_id, host_id, definition.id, now)?;
            steps += 1;
        }
        info!(steps, bootstrap = awaited.is_some(), "post-enrollment activities queued");

        if !release_automatically {
            return Ok(JobResult::Success);
        }
        let next = ProvisioningTask::ReleaseDevice {
            host: host_id,
            workflow_id,
            attempt: 0,
            started_at: None,
            awaited,
        };
        Ok(JobResult::Continue {
            args: next.to_args()?,
            delay: self.config.initial_delay,
        })
    }

    #[instrument(skip(self, started_at, awaited), fields(host_id = %host_id, workflow_id = %workflow_id))]
    fn release_device(
        &self,
        host_id: HostId,
        workflow_id: WorkflowId,
        attempt: u32,
        started_at: Option<DateTime<Utc>>,
        awaited: Option<ExecutionId>,
        now: DateTime<Utc>,
    ) -> CoreResult<JobResult> {
        let started_at = started_at.unwrap_or(now);
        let timed_out = now - started_at > chrono_delay(self.config.max_wait);

        let (acknowledged, awaited) = match awaited {
            None => (true, None),
            Some(execution_id) => self.awaited_command(host_id, workflow_id, execution_id, timed_out, now)?,
        };
        let outstanding = if timed_out { 0 } else { self.outstanding_steps(workflow_id, now)? };

        if !(timed_out || (acknowledged && outstanding == 0)) {
            debug!(attempt, acknowledged, outstanding, "device not ready for release");
            let next = ProvisioningTask::ReleaseDevice {
                host: host_id,
                workflow_id,
                attempt: attempt + 1,
                started_at: Some(started_at),
                awaited,
            };
            return Ok(JobResult::Continue {
                args: next.to_args()?,
                delay: self.config.retry_delay,
            });
        }

        if timed_out && !acknowledged {
            warn!(attempt, started_at = %started_at, "release wait exceeded, releasing unacknowledged device");
        }
        let execution_id = self.enqueue_command(host_id, workflow_id, self.release_command, now)?;
        info!(attempt, execution_id = %execution_id, "device released");
        Ok(JobResult::Success)
    }

    /// Whether the awaited command was acknowledged, and the execution to
    /// await next. A cancelled command is enqueued again while its definition
    /// exists; once the definition is gone there is nothing left to await.
    fn awaited_command(
        &self,
        host_id: HostId,
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        timed_out: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<(bool, Option<ExecutionId>)> {
        let activity = self.queue.get_result(execution_id)?;
        match activity.state {
            QueueState::Completed => Ok((true, Some(execution_id))),
            QueueState::Cancelled if timed_out => Ok((false, Some(execution_id))),
            QueueState::Cancelled => {
                if self.queue.store().definition(activity.definition_id)?.is_none() {
                    debug!(execution_id = %execution_id, "awaited command definition removed");
                    return Ok((true, None));
                }
                let retargeted = self.enqueue_command(host_id, workflow_id, activity.definition_id, now)?;
                debug!(
                    execution_id = %execution_id,
                    retargeted = %retargeted,
                    "cancelled awaited command enqueued again"
                );
                Ok((false, Some(retargeted)))
            }
            QueueState::Queued | QueueState::Active => Ok((false, Some(execution_id))),
        }
    }

    /// Steps still pending or running. Cancelled steps whose definition still
    /// exists are retargeted at a fresh activity and count as outstanding.
    fn outstanding_steps(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> CoreResult<usize> {
        let store = self.queue.store();
        let mut outstanding = 0;
        for step in store.steps(workflow_id)? {
            match step.status {
                StepStatus::Pending | StepStatus::Running => outstanding += 1,
                StepStatus::Cancelled if store.definition(step.definition_id)?.is_some() => {
                    let step = store.retarget_step(step.id, now)?;
                    debug!(step_id = %step.id, execution_id = %step.execution_id, "cancelled step retargeted");
                    outstanding += 1;
                }
                StepStatus::Cancelled | StepStatus::Succeeded | StepStatus::Failed => {}
            }
        }
        Ok(outstanding)
    }

    /// Enqueue a command unless the host already has it queued or active.
    fn enqueue_command(
        &self,
        host: HostId,
        workflow_id: WorkflowId,
        command: DefinitionId,
        now: DateTime<Utc>,
    ) -> CoreResult<ExecutionId> {
        let store = self.queue.store();
        if let Some(activity) = store.enqueue_if_idle(
            host,
            command,
            ActivityKind::Command,
            EnqueueOptions::provisioning(workflow_id),
            now,
        )? {
            return Ok(activity.execution_id);
        }
        store
            .list_pending(host)?
            .into_iter()
            .find(|a| a.definition_id == command)
            .map(|a| a.execution_id)
            .ok_or_else(|| CoreError::transient(format!("command {command} neither queued nor pending on {host}")))
    }
}

/// Register `workflow` as the handler for [`JOB_NAME`].
pub fn register<S, J, E>(executor: &mut JobExecutor<E>, workflow: Arc<ProvisioningWorkflow<S, J>>)
where
    S: FleetStore + 'static,
    J: JobStore + 'static,
    E: JobStore + 'static,
{
    executor.register_handler(JOB_NAME, move |job, ctx| workflow.handle(job, ctx));
}
