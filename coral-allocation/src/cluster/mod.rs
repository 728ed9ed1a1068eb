//! Immutable cluster model: nodes, metadata, state snapshots, health.

mod health;
mod metadata;
mod node;
mod state;

pub use health::{ClusterHealth, ClusterHealthStatus, HealthChange};
pub use metadata::{Index, IndexMetadata, Metadata};
pub use node::{DiscoveryNode, DiscoveryNodes, NodeRole};
pub use state::ClusterState;
