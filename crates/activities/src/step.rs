use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use armada_core::{CoreError, CoreResult, DefinitionId, Entity, ExecutionId, HostId, StepId, WorkflowId};

use crate::activity::{Activity, QueueState};
use crate::outcome::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn of(activity: &Activity) -> Self {
        match (activity.state, activity.status()) {
            (QueueState::Queued, _) => StepStatus::Pending,
            (QueueState::Active, _) => StepStatus::Running,
            (QueueState::Cancelled, _) => StepStatus::Cancelled,
            (QueueState::Completed, Status::Failed) => StepStatus::Failed,
            (QueueState::Completed, _) => StepStatus::Succeeded,
        }
    }
}

impl core::str::FromStr for StepStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(CoreError::validation(format!("unknown step status: {other}"))),
        }
    }
}

/// Status record a provisioning workflow keeps for each activity it waits on.
///
/// Cancellation of the underlying queued activity is written here in the same
/// transaction, which is how the workflow learns about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningStep {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    pub host: HostId,
    pub definition_id: DefinitionId,
    pub execution_id: ExecutionId,
    pub status: StepStatus,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningStep {
    pub fn for_activity(workflow_id: WorkflowId, activity: &Activity, now: DateTime<Utc>) -> Self {
        Self {
            id: StepId::new(),
            workflow_id,
            host: activity.host,
            definition_id: activity.definition_id,
            execution_id: activity.execution_id,
            status: StepStatus::of(activity),
            updated_at: now,
        }
    }

    /// Point a cancelled step at a replacement activity.
    pub fn retarget(&mut self, activity: &Activity, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != StepStatus::Cancelled {
            return Err(CoreError::precondition(format!(
                "step {} is {}; only cancelled steps can be retargeted",
                self.id,
                self.status.as_str()
            )));
        }
        if activity.host != self.host {
            return Err(CoreError::validation("replacement activity targets another host"));
        }
        self.definition_id = activity.definition_id;
        self.execution_id = activity.execution_id;
        self.status = StepStatus::of(activity);
        self.updated_at = now;
        Ok(())
    }

    pub fn sync(&mut self, activity: &Activity, now: DateTime<Utc>) {
        let status = StepStatus::of(activity);
        if status != self.status {
            self.status = status;
            self.updated_at = now;
        }
    }
}

impl Entity for ProvisioningStep {
    type Id = StepId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
