//! `armada-core`: shared building blocks for the orchestration core.
//!
//! This crate contains **pure** primitives (identifiers, the error taxonomy,
//! entity identity). It has no infrastructure concerns.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{CoreError, CoreResult};
pub use id::{DefinitionId, ExecutionId, HostId, RuleId, StepId, UnitId, WorkflowId};
