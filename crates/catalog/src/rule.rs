use serde::{Deserialize, Serialize};

use armada_core::{DefinitionId, Entity, RuleId, UnitId};

/// Automatic trigger that installs a definition on matching hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub unit: UnitId,
    pub name: String,
    pub definition_id: DefinitionId,
}

impl AutomationRule {
    pub fn new(unit: UnitId, name: impl Into<String>, definition_id: DefinitionId) -> Self {
        Self {
            id: RuleId::new(),
            unit,
            name: name.into(),
            definition_id,
        }
    }
}

impl Entity for AutomationRule {
    type Id = RuleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
