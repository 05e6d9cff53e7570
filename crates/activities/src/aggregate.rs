use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use armada_core::HostId;

use crate::activity::{Activity, ActivityKind, QueueState};
use crate::outcome::Status;

/// Fleet-wide status of one definition.
///
/// Only the most recent non-cancelled activity per host counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub pending: u64,
    pub running: u64,
    pub installed: u64,
    pub uninstalled: u64,
    /// Succeeded scripts and commands.
    pub succeeded: u64,
    pub failed: u64,
}

impl AggregateStatus {
    /// Fold the activities of a single definition.
    pub fn from_activities<'a>(activities: impl IntoIterator<Item = &'a Activity>) -> Self {
        let mut latest: HashMap<HostId, &Activity> = HashMap::new();
        for activity in activities {
            if activity.state == QueueState::Cancelled {
                continue;
            }
            latest
                .entry(activity.host)
                .and_modify(|cur| {
                    if activity.queue_key() > cur.queue_key() {
                        *cur = activity;
                    }
                })
                .or_insert(activity);
        }

        let mut agg = AggregateStatus::default();
        for activity in latest.values() {
            agg.count(activity);
        }
        agg
    }

    fn count(&mut self, activity: &Activity) {
        match (activity.state, activity.status(), activity.kind) {
            (QueueState::Queued, _, _) => self.pending += 1,
            (QueueState::Active, _, _) => self.running += 1,
            (QueueState::Completed, Status::Failed, _) => self.failed += 1,
            (QueueState::Completed, Status::Succeeded, ActivityKind::Install) => self.installed += 1,
            (QueueState::Completed, Status::Succeeded, ActivityKind::Uninstall) => self.uninstalled += 1,
            (QueueState::Completed, Status::Succeeded, _) => self.succeeded += 1,
            _ => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.installed + self.uninstalled + self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::EnqueueOptions;
    use crate::delivery::Delivery;
    use crate::outcome::ExecutionOutcome;
    use armada_catalog::{DefinitionSpec, OperationDefinition, Payload};
    use armada_core::UnitId;
    use chrono::{Duration, Utc};

    fn def() -> OperationDefinition {
        OperationDefinition::new(
            UnitId::global(),
            DefinitionSpec::new("app", "apps", Payload::package("app", "i", "u")),
            Utc::now(),
        )
    }

    fn activity(def: &OperationDefinition, host: HostId, kind: ActivityKind, seq: u64) -> Activity {
        let created = Utc::now() + Duration::seconds(seq as i64);
        Activity::new(host, def, kind, EnqueueOptions::default(), seq, created).unwrap()
    }

    fn complete(a: &mut Activity, def: &OperationDefinition, outcome: ExecutionOutcome) {
        let delivery = Delivery::materialize(a.kind, &def.spec.payload, a.host, a.execution_id).unwrap();
        a.activate(delivery, Utc::now()).unwrap();
        a.record(outcome, Utc::now()).unwrap();
    }

    #[test]
    fn counts_each_state() {
        let d = def();
        let queued = activity(&d, HostId::new(), ActivityKind::Install, 1);

        let mut running = activity(&d, HostId::new(), ActivityKind::Install, 2);
        let delivery = Delivery::materialize(running.kind, &d.spec.payload, running.host, running.execution_id).unwrap();
        running.activate(delivery, Utc::now()).unwrap();

        let mut installed = activity(&d, HostId::new(), ActivityKind::Install, 3);
        complete(&mut installed, &d, ExecutionOutcome::installed(0));

        let mut failed = activity(&d, HostId::new(), ActivityKind::Install, 4);
        complete(&mut failed, &d, ExecutionOutcome::installed(1));

        let mut removed = activity(&d, HostId::new(), ActivityKind::Uninstall, 5);
        complete(&mut removed, &d, ExecutionOutcome::uninstalled(0));

        let agg = AggregateStatus::from_activities([&queued, &running, &installed, &failed, &removed]);
        assert_eq!(
            agg,
            AggregateStatus {
                pending: 1,
                running: 1,
                installed: 1,
                uninstalled: 1,
                succeeded: 0,
                failed: 1,
            }
        );
        assert_eq!(agg.total(), 5);
    }

    #[test]
    fn newer_activity_supersedes_older_for_same_host() {
        let d = def();
        let host = HostId::new();
        let mut old = activity(&d, host, ActivityKind::Install, 1);
        complete(&mut old, &d, ExecutionOutcome::installed(1));
        let newer = activity(&d, host, ActivityKind::Install, 2);

        let agg = AggregateStatus::from_activities([&old, &newer]);
        assert_eq!(agg.failed, 0);
        assert_eq!(agg.pending, 1);
    }

    #[test]
    fn cancelled_activities_are_ignored() {
        let d = def();
        let host = HostId::new();
        let mut done = activity(&d, host, ActivityKind::Install, 1);
        complete(&mut done, &d, ExecutionOutcome::installed(0));
        let mut cancelled = activity(&d, host, ActivityKind::Install, 2);
        cancelled.cancel(Utc::now()).unwrap();

        let agg = AggregateStatus::from_activities([&done, &cancelled]);
        assert_eq!(agg.installed, 1);
        assert_eq!(agg.total(), 1);
    }
}
