//! Typed events evaluated against compiled policies.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::schema::{EventSource, LifecycleStage};

/// A single event from a sensor or a reprocessing trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A deployment spec, evaluated at deploy time.
    Deployment(Deployment),
    /// A process launched inside one of the deployment's containers.
    Process {
        deployment: Deployment,
        indicator: ProcessIndicator,
    },
    /// File activity inside a deployment's container.
    DeploymentFileAccess {
        deployment: Deployment,
        access: FileAccess,
    },
    /// File activity on a node's host filesystem.
    NodeFileAccess { node: Node, access: FileAccess },
}

/// Discriminant of [`Event`], used for field availability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Deployment,
    Process,
    DeploymentFileAccess,
    NodeFileAccess,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Deployment(_) => EventKind::Deployment,
            Event::Process { .. } => EventKind::Process,
            Event::DeploymentFileAccess { .. } => EventKind::DeploymentFileAccess,
            Event::NodeFileAccess { .. } => EventKind::NodeFileAccess,
        }
    }

    /// The event stream this event belongs to.
    pub fn source(&self) -> EventSource {
        match self {
            Event::NodeFileAccess { .. } => EventSource::NodeEvent,
            _ => EventSource::DeploymentEvent,
        }
    }

    pub fn lifecycle_stage(&self) -> LifecycleStage {
        match self {
            Event::Deployment(_) => LifecycleStage::Deploy,
            _ => LifecycleStage::Runtime,
        }
    }

    pub fn deployment(&self) -> Option<&Deployment> {
        match self {
            Event::Deployment(deployment)
            | Event::Process { deployment, .. }
            | Event::DeploymentFileAccess { deployment, .. } => Some(deployment),
            Event::NodeFileAccess { .. } => None,
        }
    }

    pub fn process(&self) -> Option<&ProcessIndicator> {
        match self {
            Event::Process { indicator, .. } => Some(indicator),
            _ => None,
        }
    }

    pub fn file_access(&self) -> Option<&FileAccess> {
        match self {
            Event::DeploymentFileAccess { access, .. } | Event::NodeFileAccess { access, .. } => {
                Some(access)
            }
            _ => None,
        }
    }

    /// Cluster and namespace coordinates used for scope resolution.
    pub fn scope_context(&self) -> ScopeContext<'_> {
        match self {
            Event::NodeFileAccess { node, .. } => ScopeContext {
                cluster_id: &node.cluster_id,
                namespace: None,
                namespace_id: None,
            },
            Event::Deployment(deployment)
            | Event::Process { deployment, .. }
            | Event::DeploymentFileAccess { deployment, .. } => ScopeContext {
                cluster_id: &deployment.cluster_id,
                namespace: Some(&deployment.namespace),
                namespace_id: Some(&deployment.namespace_id),
            },
        }
    }
}

/// Where an event happened, as seen by the scope resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeContext<'a> {
    pub cluster_id: &'a str,
    pub namespace: Option<&'a str>,
    pub namespace_id: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub namespace_id: String,
    #[serde(default)]
    pub replicas: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: ImageName,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageName {
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessIndicator {
    pub id: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub container_name: String,
    pub signal: ProcessSignal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessSignal {
    pub name: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub exec_file_path: String,
    #[serde(default)]
    pub uid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cluster_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAccess {
    pub file: FileInfo,
    pub operation: FileOperation,
}

impl FileAccess {
    pub fn new(file: FileInfo, operation: FileOperation) -> Self {
        Self { file, operation }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    #[serde(default)]
    pub actual_path: String,
    #[serde(default)]
    pub effective_path: String,
}

impl FileInfo {
    pub fn actual(path: impl Into<String>) -> Self {
        Self {
            actual_path: path.into(),
            ..Default::default()
        }
    }

    pub fn effective(path: impl Into<String>) -> Self {
        Self {
            effective_path: path.into(),
            ..Default::default()
        }
    }
}

/// Kind of file activity reported by the sensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileOperation {
    Open,
    Create,
    Unlink,
    Rename,
    PermissionChange,
    OwnershipChange,
}

impl FileOperation {
    pub const ALL: [FileOperation; 6] = [
        FileOperation::Open,
        FileOperation::Create,
        FileOperation::Unlink,
        FileOperation::Rename,
        FileOperation::PermissionChange,
        FileOperation::OwnershipChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Open => "OPEN",
            FileOperation::Create => "CREATE",
            FileOperation::Unlink => "UNLINK",
            FileOperation::Rename => "RENAME",
            FileOperation::PermissionChange => "PERMISSION_CHANGE",
            FileOperation::OwnershipChange => "OWNERSHIP_CHANGE",
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileOperation {
    type Err = String;

    /// Parses the wire name; case-insensitive so policy authors can write
    /// `open` as well as `OPEN`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        FileOperation::ALL
            .into_iter()
            .find(|op| op.as_str() == upper)
            .ok_or_else(|| format!("unknown file operation '{s}'"))
    }
}
