//! Activation selection strategies.
//!
//! Stores hand a selector the queued activities of one host, already sorted
//! in FIFO order, and activate whatever it picks. Production uses
//! [`FifoSelector`]; tests can inject [`PinnedSelector`] to force a specific
//! activation order without touching shared state.

use std::collections::HashSet;

use armada_core::{ExecutionId, HostId};

use crate::activity::Activity;

pub trait ActivationSelector: Send + Sync {
    /// Pick the activity to activate next, or `None` to leave the host idle.
    ///
    /// `queued` is ordered by `(created_at, seq)`.
    fn select<'a>(&self, host: HostId, queued: &'a [Activity]) -> Option<&'a Activity>;
}

/// Oldest queued activity first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoSelector;

impl ActivationSelector for FifoSelector {
    fn select<'a>(&self, _host: HostId, queued: &'a [Activity]) -> Option<&'a Activity> {
        queued.iter().min_by_key(|a| a.queue_key())
    }
}

/// Only activates the listed executions, oldest first. Anything else stays
/// queued.
#[derive(Debug, Clone, Default)]
pub struct PinnedSelector {
    allowed: HashSet<ExecutionId>,
}

impl PinnedSelector {
    pub fn new(allowed: impl IntoIterator<Item = ExecutionId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl ActivationSelector for PinnedSelector {
    fn select<'a>(&self, _host: HostId, queued: &'a [Activity]) -> Option<&'a Activity> {
        queued
            .iter()
            .filter(|a| self.allowed.contains(&a.execution_id))
            .min_by_key(|a| a.queue_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityKind, EnqueueOptions};
    use armada_catalog::{DefinitionSpec, OperationDefinition, Payload};
    use armada_core::UnitId;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    fn queued(host: HostId, offsets: &[(i64, u64)]) -> Vec<Activity> {
        let def = OperationDefinition::new(
            UnitId::global(),
            DefinitionSpec::new("s", "scripts", Payload::script("true")),
            Utc::now(),
        );
        let base = Utc::now();
        offsets
            .iter()
            .map(|(secs, seq)| {
                Activity::new(
                    host,
                    &def,
                    ActivityKind::Script,
                    EnqueueOptions::default(),
                    *seq,
                    base + Duration::seconds(*secs),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn fifo_picks_oldest_then_lowest_seq() {
        let host = HostId::new();
        let items = queued(host, &[(5, 1), (0, 3), (0, 2)]);
        let picked = FifoSelector.select(host, &items).unwrap();
        assert_eq!(picked.seq, 2);
    }

    #[test]
    fn fifo_on_empty_queue_is_none() {
        assert!(FifoSelector.select(HostId::new(), &[]).is_none());
    }

    #[test]
    fn pinned_only_activates_allowed() {
        let host = HostId::new();
        let items = queued(host, &[(0, 1), (1, 2), (2, 3)]);
        let pinned = PinnedSelector::new([items[2].execution_id]);
        assert_eq!(pinned.select(host, &items).unwrap().seq, 3);

        let hold = PinnedSelector::default();
        assert!(hold.select(host, &items).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn fifo_returns_minimum_queue_key(
            entries in proptest::collection::vec((0i64..50, 0u64..1000), 1..20),
        ) {
            let host = HostId::new();
            let items = queued(host, &entries);
            let picked = FifoSelector.select(host, &items).unwrap();
            prop_assert!(items.iter().all(|a| picked.queue_key() <= a.queue_key()));
        }
    }
}
