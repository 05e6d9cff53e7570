use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use armada_catalog::{OperationDefinition, Payload};
use armada_core::{CoreError, CoreResult, DefinitionId, Entity, ExecutionId, HostId, RuleId, WorkflowId};

use crate::delivery::Delivery;
use crate::outcome::{ExecutionOutcome, ExecutionResult, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Install,
    Uninstall,
    Script,
    Command,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Install => "install",
            ActivityKind::Uninstall => "uninstall",
            ActivityKind::Script => "script",
            ActivityKind::Command => "command",
        }
    }

    /// Whether this kind of activity can run the given payload.
    pub fn accepts(self, payload: &Payload) -> bool {
        matches!(
            (self, payload),
            (ActivityKind::Install | ActivityKind::Uninstall, Payload::Package { .. })
                | (ActivityKind::Script, Payload::Script { .. })
                | (ActivityKind::Command, Payload::Command { .. })
        )
    }
}

impl core::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ActivityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(ActivityKind::Install),
            "uninstall" => Ok(ActivityKind::Uninstall),
            "script" => Ok(ActivityKind::Script),
            "command" => Ok(ActivityKind::Command),
            other => Err(CoreError::validation(format!("unknown activity kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Queued,
    Active,
    Completed,
    Cancelled,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Active => "active",
            QueueState::Completed => "completed",
            QueueState::Cancelled => "cancelled",
        }
    }
}

impl core::str::FromStr for QueueState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueState::Queued),
            "active" => Ok(QueueState::Active),
            "completed" => Ok(QueueState::Completed),
            "cancelled" => Ok(QueueState::Cancelled),
            other => Err(CoreError::validation(format!("unknown queue state: {other}"))),
        }
    }
}

/// Why an activity exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Cause {
    #[default]
    Manual,
    SelfService,
    Automation(RuleId),
    Provisioning(WorkflowId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub cause: Cause,
}

impl EnqueueOptions {
    pub fn automation(rule: RuleId) -> Self {
        Self {
            cause: Cause::Automation(rule),
        }
    }

    pub fn provisioning(workflow: WorkflowId) -> Self {
        Self {
            cause: Cause::Provisioning(workflow),
        }
    }

    pub fn self_service() -> Self {
        Self {
            cause: Cause::SelfService,
        }
    }
}

/// What recording an outcome did to an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDisposition {
    /// Terminal status; the activity is now Completed.
    Completed(Status),
    /// Non-terminal report; the activity stays Active.
    InProgress(Status),
    /// Duplicate report for an already Completed activity.
    AlreadyCompleted(Status),
}

/// One operation targeted at one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub execution_id: ExecutionId,
    pub host: HostId,
    pub definition_id: DefinitionId,
    /// Title at enqueue time, kept for reporting after the definition is gone.
    pub definition_title: String,
    pub kind: ActivityKind,
    pub cause: Cause,
    pub state: QueueState,
    /// Insertion sequence, breaks ties between equal timestamps.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub delivery: Option<Delivery>,
    pub result: Option<ExecutionResult>,
}

impl Activity {
    pub fn new(
        host: HostId,
        definition: &OperationDefinition,
        kind: ActivityKind,
        options: EnqueueOptions,
        seq: u64,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        if !kind.accepts(&definition.spec.payload) {
            return Err(CoreError::precondition(format!(
                "{kind} activity cannot run '{}' ({} payload)",
                definition.title(),
                definition.spec.payload.kind_name()
            )));
        }
        Ok(Self {
            execution_id: ExecutionId::new(),
            host,
            definition_id: definition.id,
            definition_title: definition.title().to_string(),
            kind,
            cause: options.cause,
            state: QueueState::Queued,
            seq,
            created_at: now,
            activated_at: None,
            finished_at: None,
            delivery: None,
            result: None,
        })
    }

    /// FIFO position within the host queue.
    pub fn queue_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, QueueState::Queued | QueueState::Active)
    }

    pub fn status(&self) -> Status {
        match self.state {
            QueueState::Queued | QueueState::Cancelled => Status::Pending,
            QueueState::Active => Status::Running,
            QueueState::Completed => self
                .result
                .as_ref()
                .map(|r| r.status)
                .unwrap_or(Status::Running),
        }
    }

    pub fn activate(&mut self, delivery: Delivery, now: DateTime<Utc>) -> CoreResult<()> {
        if self.state != QueueState::Queued {
            return Err(CoreError::precondition(format!(
                "activity {} is {}, not queued",
                self.execution_id,
                self.state.as_str()
            )));
        }
        self.state = QueueState::Active;
        self.activated_at = Some(now);
        self.delivery = Some(delivery);
        Ok(())
    }

    /// Apply a transport report.
    pub fn record(&mut self, outcome: ExecutionOutcome, now: DateTime<Utc>) -> CoreResult<RecordDisposition> {
        match self.state {
            QueueState::Completed => return Ok(RecordDisposition::AlreadyCompleted(self.status())),
            QueueState::Active => {}
            state => {
                return Err(CoreError::precondition(format!(
                    "activity {} is {}, not active",
                    self.execution_id,
                    state.as_str()
                )));
            }
        }
        if outcome.kind() != self.kind {
            return Err(CoreError::validation(format!(
                "{} result reported for {} activity",
                outcome.kind(),
                self.kind
            )));
        }

        let created_at = self.result.as_ref().map(|r| r.created_at).unwrap_or(now);
        let mut result = ExecutionResult::new(outcome, now);
        result.created_at = created_at;
        let status = result.status;
        self.result = Some(result);

        if status.is_terminal() {
            self.state = QueueState::Completed;
            self.finished_at = Some(now);
            Ok(RecordDisposition::Completed(status))
        } else {
            Ok(RecordDisposition::InProgress(status))
        }
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.state != QueueState::Queued {
            return Err(CoreError::precondition(format!(
                "only queued activities can be cancelled; {} is {}",
                self.execution_id,
                self.state.as_str()
            )));
        }
        self.state = QueueState::Cancelled;
        self.finished_at = Some(now);
        Ok(())
    }
}

impl Entity for Activity {
    type Id = ExecutionId;

    fn id(&self) -> &Self::Id {
        &self.execution_id
    }
}
