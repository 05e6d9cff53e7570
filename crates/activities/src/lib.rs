//! Host activity model.
//!
//! Pure domain logic for per-host activities: queue states, delivery
//! materialization, result status derivation, activation selection and
//! fleet-wide aggregate status. No IO; stores in `armada-infra` drive it.

pub mod activity;
pub mod aggregate;
pub mod delivery;
pub mod outcome;
pub mod selector;
pub mod step;

pub use activity::{Activity, ActivityKind, Cause, EnqueueOptions, QueueState, RecordDisposition};
pub use aggregate::AggregateStatus;
pub use delivery::Delivery;
pub use outcome::{ExecutionOutcome, ExecutionResult, Status};
pub use selector::{ActivationSelector, FifoSelector, PinnedSelector};
pub use step::{ProvisioningStep, StepStatus};
