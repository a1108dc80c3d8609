//! # Cluster bring-up
//!
//! ```text
//!  credentials ─► stack ─► discovery ─► topology ─► render
//!                                                     │
//!                  ┌──────────────────┬───────────────┤
//!                  ▼                  ▼               ▼
//!            ┌───────────┐      ┌───────────┐   ┌───────────┐
//!            │  node 1   │      │  node 2   │   │  node N   │
//!            │ upload ×3 │      │ upload ×3 │   │ upload ×3 │
//!            │ activate  │      │ activate  │   │ activate  │
//!            └───────────┘      └───────────┘   └───────────┘
//! ```
//!
//! - [`node`]: node descriptors as reported by the inventory
//! - [`topology`]: manager, seed hosts and heap budget for a node set
//! - [`orchestrator`]: the run itself, with a per-node fan-out

pub mod node;
pub mod orchestrator;
pub mod topology;

pub use node::{select_cluster_nodes, LifecycleState, NodeDescriptor, NAME_TAG};
pub use orchestrator::{
    ClusterOrchestrator, Collaborators, NodeReport, NodeStatus, OrchestratorError, Phase,
    RunOptions, RunReport, RunStatus,
};
pub use topology::{ClusterTopology, MemoryBudget, TopologyError, MAX_MEMORY_GIB};
