//! Operation Catalog: versioned definitions of installable/runnable operations.
//!
//! Pure domain crate. It supplies definitions, audience matching and the
//! replace-diff planner; it has no queue logic and performs no IO.

pub mod definition;
pub mod diff;
pub mod host;
pub mod rule;

pub use definition::{AudienceRule, Change, DefinitionKey, DefinitionSpec, OperationDefinition, Payload};
pub use diff::{PlannedUpdate, ReplacePlan, deletion_guard, plan_replace};
pub use host::Host;
pub use rule::AutomationRule;
