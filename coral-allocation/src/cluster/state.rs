//! Immutable cluster state snapshots
//!
//! A snapshot is the complete input to one allocation operation. The single
//! writer that owns cluster-state updates builds snapshots; this crate never
//! mutates one, it only derives replacements.

use super::metadata::Metadata;
use super::node::DiscoveryNodes;
use crate::routing::RoutingTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One immutable cluster state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    /// Name of the cluster
    pub cluster_name: String,

    /// Monotonic state version, bumped by the publisher
    pub version: u64,

    /// Live nodes with roles and attributes
    pub nodes: DiscoveryNodes,

    /// Per-index metadata
    pub metadata: Arc<Metadata>,

    /// Current shard routing
    pub routing_table: Arc<RoutingTable>,
}

impl ClusterState {
    pub fn new(
        cluster_name: &str,
        version: u64,
        nodes: DiscoveryNodes,
        metadata: Metadata,
        routing_table: RoutingTable,
    ) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            version,
            nodes,
            metadata: Arc::new(metadata),
            routing_table: Arc::new(routing_table),
        }
    }

    /// Derive the successor state from an allocation result, bumping versions
    pub fn with_routing(
        &self,
        routing_table: Arc<RoutingTable>,
        metadata: Arc<Metadata>,
    ) -> Self {
        let mut table_version = routing_table.version;
        if !Arc::ptr_eq(&routing_table, &self.routing_table) {
            table_version += 1;
        }
        let mut next = self.clone();
        next.version += 1;
        next.metadata = metadata;
        next.routing_table = if table_version == routing_table.version {
            routing_table
        } else {
            let mut bumped = (*routing_table).clone();
            bumped.version = table_version;
            Arc::new(bumped)
        };
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryNode, IndexMetadata};

    fn make_state() -> ClusterState {
        let meta = IndexMetadata::new("logs", 1, 0);
        let mut table = RoutingTable::new(3);
        table.add_index_as_new(&meta, 0, 0);
        ClusterState::new(
            "test-cluster",
            10,
            DiscoveryNodes::new([DiscoveryNode::new("node-1")]),
            Metadata::new([meta]),
            table,
        )
    }

    #[test]
    fn test_with_routing_keeps_identity_when_unchanged() {
        let state = make_state();
        let next = state.with_routing(
            Arc::clone(&state.routing_table),
            Arc::clone(&state.metadata),
        );
        assert_eq!(next.version, 11);
        assert!(Arc::ptr_eq(&next.routing_table, &state.routing_table));
        assert_eq!(next.routing_table.version, 3);
    }

    #[test]
    fn test_with_routing_bumps_changed_table() {
        let state = make_state();
        let changed = Arc::new((*state.routing_table).clone());
        let next = state.with_routing(changed, Arc::clone(&state.metadata));
        assert_eq!(next.routing_table.version, 4);
    }
}
