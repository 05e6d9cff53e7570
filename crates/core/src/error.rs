//! Error taxonomy shared by every component of the orchestration core.

use thiserror::Error;

/// Result type used across the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error.
///
/// Each variant maps to one handling policy:
///
/// | variant | policy |
/// |---|---|
/// | `NotFound` | surfaced to the caller, never retried |
/// | `PreconditionFailed` | surfaced, caller must correct the request |
/// | `Conflict` | lost a concurrent race; retried locally, not an error condition |
/// | `Transient` | storage/transport hiccup; retried by the job's backoff policy |
/// | `Terminal` | cannot succeed; recorded on the job/activity row |
/// | `Validation` | malformed input, rejected before touching storage |
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether a deferred job hitting this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }
}
