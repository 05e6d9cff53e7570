//! Infrastructure layer: stores, queue services, deferred jobs, workflows
//! and configuration.

pub mod config;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod workflows;

pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use queue::ActivityQueue;
pub use reconciler::BatchReconciler;
