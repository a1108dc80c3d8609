//! Topology resolution
//!
//! Turns the discovered node set into the values the cluster configuration
//! needs: manager node, seed hosts, node count and heap budget.
//!
//! The manager is the first node in discovery order. There is no election and
//! no health check; the inventory does not promise a stable order across
//! calls, so two runs against the same cluster can pick different managers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::node::NodeDescriptor;
use crate::cloud::{CloudError, ComputeInventory};

/// Hard ceiling on the heap budget in GiB
pub const MAX_MEMORY_GIB: u64 = 32;

/// Errors during topology resolution
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("No nodes to build a cluster from")]
    EmptyTopology,

    #[error("Node {0} has no private address")]
    MissingPrivateAddress(String),

    #[error("Memory lookup for instance class '{class}' failed: {source}")]
    MetadataLookup {
        class: String,
        #[source]
        source: CloudError,
    },

    #[error("Instance memory of {0} MiB leaves no heap budget")]
    InsufficientMemory(u64),
}

/// Per-node heap budget in GiB, always in `1..=MAX_MEMORY_GIB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryBudget(u64);

impl MemoryBudget {
    pub fn new(gib: u64) -> Option<Self> {
        (gib > 0 && gib <= MAX_MEMORY_GIB).then_some(Self(gib))
    }

    /// Half of the instance memory, rounded down to whole GiB and capped
    pub fn from_instance_memory(mib: u64) -> Result<Self, TopologyError> {
        let half = (mib / 1024) / 2;
        Self::new(half.min(MAX_MEMORY_GIB)).ok_or(TopologyError::InsufficientMemory(mib))
    }

    pub fn gib(&self) -> u64 {
        self.0
    }

    /// JVM size notation, e.g. `4g`
    pub fn heap_size(&self) -> String {
        format!("{}g", self.0)
    }
}

impl fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} GiB", self.0)
    }
}

/// Derived cluster layout for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Host name of the bootstrap manager (`ip-a-b-c-d`)
    pub manager: String,
    /// Internal DNS names of every node, in discovery order
    pub seed_hosts: Vec<String>,
    pub node_count: usize,
    pub memory_budget: MemoryBudget,
}

/// Host name a node gets from its private address
pub fn internal_host_name(private_address: &str) -> String {
    format!("ip-{}", private_address.replace('.', "-"))
}

/// Regional internal DNS name of a private address
pub fn internal_dns_name(private_address: &str, region: &str) -> String {
    format!("{}.{}.compute.internal", private_address, region)
}

fn private_addresses(nodes: &[NodeDescriptor]) -> Result<Vec<&str>, TopologyError> {
    nodes
        .iter()
        .map(|n| {
            n.private_address
                .as_deref()
                .ok_or_else(|| TopologyError::MissingPrivateAddress(n.id.clone()))
        })
        .collect()
}

/// Resolve the topology from already-filtered nodes and a known memory size
pub fn resolve_with_memory(
    nodes: &[NodeDescriptor],
    region: &str,
    instance_memory_mib: u64,
) -> Result<ClusterTopology, TopologyError> {
    let addresses = private_addresses(nodes)?;
    let first = addresses.first().ok_or(TopologyError::EmptyTopology)?;

    Ok(ClusterTopology {
        manager: internal_host_name(first),
        seed_hosts: addresses
            .iter()
            .map(|addr| internal_dns_name(addr, region))
            .collect(),
        node_count: addresses.len(),
        memory_budget: MemoryBudget::from_instance_memory(instance_memory_mib)?,
    })
}

/// Resolve the topology, looking up the instance memory from `inventory`
pub async fn resolve(
    inventory: &dyn ComputeInventory,
    nodes: &[NodeDescriptor],
    instance_class: &str,
    region: &str,
) -> Result<ClusterTopology, TopologyError> {
    if nodes.is_empty() {
        return Err(TopologyError::EmptyTopology);
    }
    let memory = inventory
        .instance_memory_mib(instance_class)
        .await
        .map_err(|source| TopologyError::MetadataLookup {
            class: instance_class.to_string(),
            source,
        })?;
    resolve_with_memory(nodes, region, memory)
}
