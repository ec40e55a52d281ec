use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::FileOperation;

/// A declarative security policy as handed over by the policy store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    /// Unique policy identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub severity: Severity,
    /// Disabled policies stay registered but are never evaluated.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub lifecycle_stages: Vec<LifecycleStage>,
    #[serde(default)]
    pub event_source: EventSource,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Sections are OR'd: the policy matches if any section matches.
    #[serde(default)]
    pub policy_sections: Vec<PolicySection>,
    /// Scope entries are OR'd. No entries means every cluster and namespace.
    #[serde(default)]
    pub scope: Vec<Scope>,
    #[serde(default)]
    pub exclusions: Vec<Exclusion>,
    /// IDs of the notifiers alerts for this policy are routed to.
    #[serde(default)]
    pub notifiers: Vec<String>,
}

impl Policy {
    /// Whether the policy applies to events raised at `stage`.
    pub fn has_lifecycle_stage(&self, stage: LifecycleStage) -> bool {
        self.lifecycle_stages.contains(&stage)
    }
}

/// A clause of a policy. All groups must match for the section to match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySection {
    #[serde(default)]
    pub section_name: Option<String>,
    #[serde(default)]
    pub policy_groups: Vec<PolicyGroup>,
}

/// A single field predicate inside a section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyGroup {
    /// Display name of the field, e.g. `"Image Tag"`.
    pub field_name: String,
    /// String-encoded comparison values; any value matching is enough.
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub negate: bool,
    /// Optional restriction to a set of file operations. With `negate` set,
    /// the negation applies to this set instead of the field values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<FileOperation>>,
}

impl PolicyGroup {
    pub fn new(field_name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            field_name: field_name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
            negate: false,
            operations: None,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn with_operations(mut self, operations: &[FileOperation]) -> Self {
        self.operations = Some(operations.to_vec());
        self
    }
}

/// Restricts which clusters and namespaces a policy applies to.
///
/// Either the direct fields (`cluster`, `namespace`) or the label fields
/// (`cluster_label`, `namespace_label`) may be used in one entry, not both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Scope {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub cluster_label: Option<ScopeLabel>,
    #[serde(default)]
    pub namespace_label: Option<ScopeLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScopeLabel {
    pub key: String,
    pub value: String,
}

impl ScopeLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Exempts matching deployments from a policy, optionally until a deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exclusion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deployment: Option<ExcludedDeployment>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExcludedDeployment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope: Option<Scope>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStage {
    Build,
    Deploy,
    Runtime,
}

/// Which event stream a runtime policy listens to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSource {
    #[default]
    NotApplicable,
    DeploymentEvent,
    NodeEvent,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventSource::NotApplicable => "NOT_APPLICABLE",
            EventSource::DeploymentEvent => "DEPLOYMENT_EVENT",
            EventSource::NodeEvent => "NODE_EVENT",
        };
        f.write_str(s)
    }
}
