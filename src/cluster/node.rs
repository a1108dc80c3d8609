//! Node descriptors as reported by the compute inventory
//!
//! A `NodeDescriptor` is an immutable snapshot of one compute instance taken at
//! discovery time. Nothing here is cached between runs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tag key carrying the instance name
pub const NAME_TAG: &str = "Name";

/// Lifecycle state of a compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Terminated => "terminated",
        }
    }

    /// States surfaced by inventory listings
    pub fn is_listed(&self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LifecycleState::Pending),
            "running" => Ok(LifecycleState::Running),
            "stopping" => Ok(LifecycleState::Stopping),
            "stopped" => Ok(LifecycleState::Stopped),
            "shutting-down" => Ok(LifecycleState::ShuttingDown),
            "terminated" => Ok(LifecycleState::Terminated),
            other => Err(format!("unknown lifecycle state '{}'", other)),
        }
    }
}

/// Snapshot of one compute instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub instance_class: String,
}

impl NodeDescriptor {
    pub fn new(
        id: impl Into<String>,
        state: LifecycleState,
        instance_class: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            state,
            private_address: None,
            public_address: None,
            tags: BTreeMap::new(),
            instance_class: instance_class.into(),
        }
    }

    pub fn with_private_address(mut self, address: impl Into<String>) -> Self {
        self.private_address = Some(address.into());
        self
    }

    pub fn with_public_address(mut self, address: impl Into<String>) -> Self {
        self.public_address = Some(address.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Value of the `Name` tag, if any
    pub fn name(&self) -> Option<&str> {
        self.tags.get(NAME_TAG).map(|s| s.as_str())
    }

    /// True when the `Name` tag starts with `prefix`
    pub fn name_starts_with(&self, prefix: &str) -> bool {
        self.name().map(|n| n.starts_with(prefix)).unwrap_or(false)
    }
}

/// Keep running nodes whose name tag starts with `prefix`, preserving discovery order
pub fn select_cluster_nodes(nodes: Vec<NodeDescriptor>, prefix: &str) -> Vec<NodeDescriptor> {
    nodes
        .into_iter()
        .filter(|n| n.state == LifecycleState::Running && n.name_starts_with(prefix))
        .collect()
}
