//! Cluster health derivation
//!
//! Health is a pure function of the routing table:
//!
//! ```text
//! GREEN:  every primary and every replica is active
//! YELLOW: every primary is active, at least one replica is not
//! RED:    at least one primary is not active
//! ```
//!
//! The allocation service computes health before and after each commit and
//! reports a `HealthChange` when the status moved.

use crate::routing::RoutingTable;
use serde::{Deserialize, Serialize};

/// Coarse cluster health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealthStatus {
    Green,
    Yellow,
    Red,
}

impl ClusterHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterHealthStatus::Green => "green",
            ClusterHealthStatus::Yellow => "yellow",
            ClusterHealthStatus::Red => "red",
        }
    }
}

/// Health summary of one routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: ClusterHealthStatus,
    pub active_shards: usize,
    pub initializing_shards: usize,
    pub relocating_shards: usize,
    pub unassigned_shards: usize,
    pub delayed_unassigned_shards: usize,
    pub active_primaries: usize,
}

impl ClusterHealth {
    /// Derive the health summary from a routing table
    pub fn from_table(table: &RoutingTable) -> Self {
        let mut active_shards = 0;
        let mut initializing_shards = 0;
        let mut relocating_shards = 0;
        let mut unassigned_shards = 0;
        let mut delayed_unassigned_shards = 0;
        let mut active_primaries = 0;
        let mut status = ClusterHealthStatus::Green;

        for index in table.iter() {
            for group in index.iter() {
                for shard in group.iter() {
                    if shard.is_relocating() {
                        active_shards += 1;
                        relocating_shards += 1;
                    } else if shard.is_started() {
                        active_shards += 1;
                    } else if shard.is_initializing() {
                        initializing_shards += 1;
                    } else {
                        unassigned_shards += 1;
                        if shard
                            .unassigned_info
                            .as_ref()
                            .map(|i| i.delayed)
                            .unwrap_or(false)
                        {
                            delayed_unassigned_shards += 1;
                        }
                    }
                }

                match group.primary() {
                    Some(primary) if primary.is_active() => {
                        active_primaries += 1;
                        if group.replicas().any(|r| !r.is_active()) {
                            status = status.max(ClusterHealthStatus::Yellow);
                        }
                    }
                    _ => status = ClusterHealthStatus::Red,
                }
            }
        }

        Self {
            status,
            active_shards,
            initializing_shards,
            relocating_shards,
            unassigned_shards,
            delayed_unassigned_shards,
            active_primaries,
        }
    }
}

/// Emitted when a commit moved the cluster health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthChange {
    pub from: ClusterHealthStatus,
    pub to: ClusterHealthStatus,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata};
    use crate::routing::{RoutingNodes, RoutingTable};

    fn make_parts(replicas: u32) -> (RoutingNodes, Metadata) {
        let meta = IndexMetadata::new("logs", 1, replicas);
        let metadata = Metadata::new([meta.clone()]);
        let mut table = RoutingTable::new(0);
        table.add_index_as_new(&meta, 0, 0);
        let nodes = DiscoveryNodes::new([
            DiscoveryNode::new("node-1"),
            DiscoveryNode::new("node-2"),
        ]);
        (RoutingNodes::from_state(&table, &nodes), metadata)
    }

    fn assign(view: &mut RoutingNodes, primary: bool, node: &str) {
        let shard = view
            .unassigned_mut()
            .remove_first(|s| s.primary == primary)
            .unwrap();
        let initializing = view.initialize(shard, node, None, -1).unwrap();
        view.start_shard(&initializing).unwrap();
    }

    #[test]
    fn test_unassigned_primary_is_red() {
        let (view, metadata) = make_parts(0);
        let health = ClusterHealth::from_table(&view.to_routing_table(0, &metadata));
        assert_eq!(health.status, ClusterHealthStatus::Red);
        assert_eq!(health.unassigned_shards, 1);
        assert_eq!(health.active_primaries, 0);
    }

    #[test]
    fn test_missing_replica_is_yellow() {
        let (mut view, metadata) = make_parts(1);
        assign(&mut view, true, "node-1");

        let health = ClusterHealth::from_table(&view.to_routing_table(0, &metadata));
        assert_eq!(health.status, ClusterHealthStatus::Yellow);
        assert_eq!(health.active_shards, 1);
        assert_eq!(health.unassigned_shards, 1);
    }

    #[test]
    fn test_all_active_is_green() {
        let (mut view, metadata) = make_parts(1);
        assign(&mut view, true, "node-1");
        assign(&mut view, false, "node-2");

        let health = ClusterHealth::from_table(&view.to_routing_table(0, &metadata));
        assert_eq!(health.status, ClusterHealthStatus::Green);
        assert_eq!(health.active_shards, 2);
        assert_eq!(health.active_primaries, 1);
    }

    #[test]
    fn test_status_ordering() {
        assert!(ClusterHealthStatus::Green < ClusterHealthStatus::Yellow);
        assert!(ClusterHealthStatus::Yellow < ClusterHealthStatus::Red);
    }
}
