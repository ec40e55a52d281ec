//! Violations and alerts produced by a policy match.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Event, FileAccess, ProcessIndicator};
use crate::schema::{LifecycleStage, Policy, Severity};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    Generic,
    Process,
    FileAccess,
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViolationType::Generic => "GENERIC",
            ViolationType::Process => "PROCESS",
            ViolationType::FileAccess => "FILE_ACCESS",
        })
    }
}

/// One reason a policy matched an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertViolation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub message: String,
    /// The event's own file access, copied verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_access: Option<FileAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessIndicator>,
}

impl AlertViolation {
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            violation_type: ViolationType::Generic,
            message: message.into(),
            file_access: None,
            process: None,
        }
    }

    pub fn file_access(access: &FileAccess) -> Self {
        let path = if access.file.actual_path.is_empty() {
            &access.file.effective_path
        } else {
            &access.file.actual_path
        };
        Self {
            violation_type: ViolationType::FileAccess,
            message: format!("'{path}' accessed ({})", access.operation),
            file_access: Some(access.clone()),
            process: None,
        }
    }

    pub fn process(indicator: &ProcessIndicator) -> Self {
        let signal = &indicator.signal;
        let binary = if signal.exec_file_path.is_empty() {
            &signal.name
        } else {
            &signal.exec_file_path
        };
        let message = if signal.args.is_empty() {
            format!("Binary '{binary}' executed without arguments under user ID {}", signal.uid)
        } else {
            format!(
                "Binary '{binary}' executed with arguments '{}' under user ID {}",
                signal.args, signal.uid
            )
        };
        Self {
            violation_type: ViolationType::Process,
            message,
            file_access: None,
            process: Some(indicator.clone()),
        }
    }
}

/// The violations of one (policy, event) evaluation. Empty means no match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Violations {
    pub alert_violations: Vec<AlertViolation>,
}

impl Violations {
    pub fn is_empty(&self) -> bool {
        self.alert_violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.alert_violations.len()
    }
}

/// What an alert was raised against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEntity {
    Deployment {
        id: String,
        name: String,
        cluster_id: String,
        namespace: String,
    },
    Node {
        id: String,
        name: String,
        cluster_id: String,
    },
}

impl AlertEntity {
    pub fn from_event(event: &Event) -> Self {
        match event {
            Event::NodeFileAccess { node, .. } => AlertEntity::Node {
                id: node.id.clone(),
                name: node.name.clone(),
                cluster_id: node.cluster_id.clone(),
            },
            Event::Deployment(deployment)
            | Event::Process { deployment, .. }
            | Event::DeploymentFileAccess { deployment, .. } => AlertEntity::Deployment {
                id: deployment.id.clone(),
                name: deployment.name.clone(),
                cluster_id: deployment.cluster_id.clone(),
                namespace: deployment.namespace.clone(),
            },
        }
    }
}

/// A matched policy and its violations, ready for an alerting consumer.
/// The engine never persists or routes alerts itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub policy_id: String,
    pub policy_name: String,
    pub severity: Severity,
    pub lifecycle_stage: LifecycleStage,
    pub entity: AlertEntity,
    pub time: DateTime<Utc>,
    pub violations: Vec<AlertViolation>,
}

impl Alert {
    pub fn new(policy: &Policy, event: &Event, violations: Violations) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_id: policy.id.clone(),
            policy_name: policy.name.clone(),
            severity: policy.severity,
            lifecycle_stage: event.lifecycle_stage(),
            entity: AlertEntity::from_event(event),
            time: Utc::now(),
            violations: violations.alert_violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FileInfo, FileOperation, ProcessSignal};

    #[test]
    fn file_access_violation_prefers_actual_path() {
        let access = FileAccess {
            file: FileInfo {
                actual_path: "/etc/passwd".into(),
                effective_path: "/host/etc/passwd".into(),
            },
            operation: FileOperation::Open,
        };
        let v = AlertViolation::file_access(&access);
        assert_eq!(v.violation_type, ViolationType::FileAccess);
        assert_eq!(v.message, "'/etc/passwd' accessed (OPEN)");
        assert_eq!(v.file_access.as_ref(), Some(&access));

        let effective_only = FileAccess::new(FileInfo::effective("/etc/shadow"), FileOperation::Unlink);
        let v = AlertViolation::file_access(&effective_only);
        assert_eq!(v.message, "'/etc/shadow' accessed (UNLINK)");
    }

    #[test]
    fn process_violation_message() {
        let indicator = ProcessIndicator {
            id: "pi1".into(),
            signal: ProcessSignal {
                name: "curl".into(),
                args: "http://example.com".into(),
                exec_file_path: "/usr/bin/curl".into(),
                uid: 0,
            },
            ..Default::default()
        };
        let v = AlertViolation::process(&indicator);
        assert_eq!(
            v.message,
            "Binary '/usr/bin/curl' executed with arguments 'http://example.com' under user ID 0"
        );
        assert_eq!(v.process.as_ref().map(|p| p.id.as_str()), Some("pi1"));
    }

    #[test]
    fn violation_serializes_type_tag() {
        let json = serde_json::to_value(AlertViolation::generic("tag matched")).unwrap();
        assert_eq!(json["type"], "GENERIC");
        assert!(json.get("file_access").is_none());
    }
}
