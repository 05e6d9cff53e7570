use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use armada_core::{Entity, HostId, UnitId};

/// A managed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub unit: UnitId,
    pub hostname: String,
    pub labels: BTreeSet<String>,
}

impl Host {
    pub fn new(unit: UnitId, hostname: impl Into<String>) -> Self {
        Self {
            id: HostId::new(),
            unit,
            hostname: hostname.into(),
            labels: BTreeSet::new(),
        }
    }

    pub fn with_labels<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> Self {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }
}

impl Entity for Host {
    type Id = HostId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
