use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use armada_core::{CoreError, CoreResult, DefinitionId, Entity, UnitId};

/// Label-based audience of a definition.
///
/// A host matches when it carries at least one label from `include_any` (or
/// the set is empty) and none from `exclude_any`. The two sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceRule {
    include_any: BTreeSet<String>,
    exclude_any: BTreeSet<String>,
}

impl AudienceRule {
    /// Rule that matches every host.
    pub fn everyone() -> Self {
        Self::default()
    }

    pub fn new<I, E, S>(include_any: I, exclude_any: E) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let include_any: BTreeSet<String> = include_any.into_iter().map(Into::into).collect();
        let exclude_any: BTreeSet<String> = exclude_any.into_iter().map(Into::into).collect();

        if let Some(label) = include_any.intersection(&exclude_any).next() {
            return Err(CoreError::validation(format!(
                "label '{label}' is both included and excluded"
            )));
        }

        Ok(Self {
            include_any,
            exclude_any,
        })
    }

    pub fn include_any<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            include_any: labels.into_iter().map(Into::into).collect(),
            exclude_any: BTreeSet::new(),
        }
    }

    pub fn exclude_any<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            include_any: BTreeSet::new(),
            exclude_any: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn included(&self) -> &BTreeSet<String> {
        &self.include_any
    }

    pub fn excluded(&self) -> &BTreeSet<String> {
        &self.exclude_any
    }

    pub fn matches(&self, labels: &BTreeSet<String>) -> bool {
        let included =
            self.include_any.is_empty() || self.include_any.iter().any(|l| labels.contains(l));
        let excluded = self.exclude_any.iter().any(|l| labels.contains(l));
        included && !excluded
    }
}

/// Executable payload of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A software package with its install lifecycle scripts.
    Package {
        package_name: String,
        install_script: String,
        post_install_script: Option<String>,
        uninstall_script: String,
        /// Query run before installing; an empty result means "condition not satisfied".
        pre_check_query: Option<String>,
    },
    /// A script run as-is on the host.
    Script { contents: String },
    /// A remote-management command template.
    Command {
        request_type: String,
        template: String,
    },
}

impl Payload {
    pub fn package(name: impl Into<String>, install: impl Into<String>, uninstall: impl Into<String>) -> Self {
        Payload::Package {
            package_name: name.into(),
            install_script: install.into(),
            post_install_script: None,
            uninstall_script: uninstall.into(),
            pre_check_query: None,
        }
    }

    pub fn script(contents: impl Into<String>) -> Self {
        Payload::Script {
            contents: contents.into(),
        }
    }

    pub fn command(request_type: impl Into<String>, template: impl Into<String>) -> Self {
        Payload::Command {
            request_type: request_type.into(),
            template: template.into(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Package { .. } => "package",
            Payload::Script { .. } => "script",
            Payload::Command { .. } => "command",
        }
    }
}

/// Identity used to match desired definitions against stored ones.
///
/// Callers should supply a stable key. Without one, the `(title, source,
/// bundle_id)` tuple is used as a fallback; two entries with the same title
/// but different bundle ids are different definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DefinitionKey {
    Stable(String),
    Tuple {
        title: String,
        source: String,
        bundle_id: Option<String>,
    },
}

impl core::fmt::Display for DefinitionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DefinitionKey::Stable(key) => write!(f, "{key}"),
            DefinitionKey::Tuple {
                title,
                source,
                bundle_id: Some(bundle),
            } => write!(f, "{title}/{source}/{bundle}"),
            DefinitionKey::Tuple { title, source, .. } => write!(f, "{title}/{source}"),
        }
    }
}

/// How a desired spec differs from the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    /// Only non-executable flags changed; queued activities stay valid.
    MetadataOnly,
    /// Payload, audience or content hash changed; queued activities are stale.
    Payload,
}

/// Desired content of a definition, as uploaded or batch-applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionSpec {
    pub title: String,
    pub source: String,
    pub bundle_id: Option<String>,
    pub stable_key: Option<String>,
    /// External content hash of the package bytes, when known.
    pub content_hash: Option<String>,
    pub payload: Payload,
    pub audience: AudienceRule,
    pub self_service: bool,
    /// Installed during initial provisioning; removal must be explicit.
    pub required_for_provisioning: bool,
}

impl DefinitionSpec {
    pub fn new(title: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            title: title.into(),
            source: source.into(),
            bundle_id: None,
            stable_key: None,
            content_hash: None,
            payload,
            audience: AudienceRule::everyone(),
            self_service: false,
            required_for_provisioning: false,
        }
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn with_stable_key(mut self, key: impl Into<String>) -> Self {
        self.stable_key = Some(key.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_audience(mut self, audience: AudienceRule) -> Self {
        self.audience = audience;
        self
    }

    pub fn self_service(mut self, enabled: bool) -> Self {
        self.self_service = enabled;
        self
    }

    pub fn required_for_provisioning(mut self, required: bool) -> Self {
        self.required_for_provisioning = required;
        self
    }

    pub fn key(&self) -> DefinitionKey {
        match &self.stable_key {
            Some(key) => DefinitionKey::Stable(key.clone()),
            None => DefinitionKey::Tuple {
                title: self.title.clone(),
                source: self.source.clone(),
                bundle_id: self.bundle_id.clone(),
            },
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.title.trim().is_empty() {
            return Err(CoreError::validation("title cannot be empty"));
        }
        if let Some(key) = &self.stable_key {
            if key.trim().is_empty() {
                return Err(CoreError::validation("stable key cannot be blank"));
            }
        }
        match &self.payload {
            Payload::Package { install_script, .. } if install_script.trim().is_empty() => {
                Err(CoreError::validation("install script cannot be empty"))
            }
            Payload::Script { contents } if contents.trim().is_empty() => {
                Err(CoreError::validation("script contents cannot be empty"))
            }
            Payload::Command { request_type, .. } if request_type.trim().is_empty() => {
                Err(CoreError::validation("command request type cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Classify the difference between `self` (desired) and `current` (stored).
    pub fn change_from(&self, current: &DefinitionSpec) -> Change {
        if self == current {
            return Change::Unchanged;
        }
        let executable_changed = self.payload != current.payload
            || self.audience != current.audience
            || self.content_hash != current.content_hash
            || self.title != current.title
            || self.source != current.source
            || self.bundle_id != current.bundle_id;
        if executable_changed {
            Change::Payload
        } else {
            Change::MetadataOnly
        }
    }
}

/// A stored operation definition. Immutable by replacement: updates swap the
/// whole spec and bump `revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDefinition {
    pub id: DefinitionId,
    pub unit: UnitId,
    pub spec: DefinitionSpec,
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationDefinition {
    pub fn new(unit: UnitId, spec: DefinitionSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: DefinitionId::new(),
            unit,
            spec,
            revision: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> DefinitionKey {
        self.spec.key()
    }

    pub fn title(&self) -> &str {
        &self.spec.title
    }

    /// Replace the definition body wholesale.
    pub fn replace_spec(&mut self, spec: DefinitionSpec, now: DateTime<Utc>) {
        self.spec = spec;
        self.revision += 1;
        self.updated_at = now;
    }
}

impl Entity for OperationDefinition {
    type Id = DefinitionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn spec() -> DefinitionSpec {
        DefinitionSpec::new("firefox", "apps", Payload::package("firefox.pkg", "install", "uninstall"))
    }

    #[test]
    fn empty_rule_matches_everyone() {
        let rule = AudienceRule::everyone();
        assert!(rule.matches(&labels(&[])));
        assert!(rule.matches(&labels(&["laptops"])));
    }

    #[test]
    fn include_any_requires_one_label() {
        let rule = AudienceRule::include_any(["laptops", "desktops"]);
        assert!(rule.matches(&labels(&["desktops", "finance"])));
        assert!(!rule.matches(&labels(&["servers"])));
    }

    #[test]
    fn exclude_any_wins_over_include() {
        let rule = AudienceRule::new(["laptops"], ["kiosk"]).unwrap();
        assert!(rule.matches(&labels(&["laptops"])));
        assert!(!rule.matches(&labels(&["laptops", "kiosk"])));
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let err = AudienceRule::new(["a", "b"], ["b"]).unwrap_err();
        assert!(matches!(err, CoreError::Validation(msg) if msg.contains("'b'")));
    }

    #[test]
    fn stable_key_takes_precedence_over_tuple() {
        let keyed = spec().with_stable_key("sha256:abc");
        assert_eq!(keyed.key(), DefinitionKey::Stable("sha256:abc".into()));
        assert!(matches!(spec().key(), DefinitionKey::Tuple { .. }));
    }

    #[test]
    fn bundle_id_is_part_of_tuple_key() {
        let a = spec().with_bundle_id("org.mozilla.firefox");
        let b = spec().with_bundle_id("org.mozilla.nightly");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn change_classification() {
        let current = spec();
        assert_eq!(spec().change_from(&current), Change::Unchanged);
        assert_eq!(spec().self_service(true).change_from(&current), Change::MetadataOnly);
        assert_eq!(
            spec().with_content_hash("deadbeef").change_from(&current),
            Change::Payload
        );
        assert_eq!(
            spec()
                .with_audience(AudienceRule::include_any(["x"]))
                .change_from(&current),
            Change::Payload
        );
    }

    #[test]
    fn validation_rejects_empty_fields() {
        assert!(spec().validate().is_ok());
        let mut blank = spec();
        blank.title = "  ".into();
        assert!(blank.validate().is_err());
        let script = DefinitionSpec::new("s", "scripts", Payload::script(""));
        assert!(script.validate().is_err());
    }

    #[test]
    fn replace_spec_bumps_revision() {
        let now = Utc::now();
        let mut def = OperationDefinition::new(UnitId::global(), spec(), now);
        def.replace_spec(spec().self_service(true), now);
        assert_eq!(def.revision, 2);
        assert!(def.spec.self_service);
    }
}
