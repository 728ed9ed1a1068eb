//! One copy of a shard per node (and optionally per host)

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// Refuses to put two copies of the same shard on one node, or on two nodes
/// sharing a `host` attribute when the same-host check is enabled.
pub struct SameShardDecider;

impl AllocationDecider for SameShardDecider {
    fn name(&self) -> &'static str {
        "same_shard"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        if allocation
            .routing_nodes()
            .shard_on_node(&shard.shard_id, node.node_id())
            .is_some()
        {
            return DeciderVerdict::no(format!(
                "a copy of {} already exists on node {}",
                shard.shard_id,
                node.node_id()
            ));
        }

        if allocation.settings().same_shard_host {
            if let Some(host) = allocation
                .nodes()
                .get(node.node_id())
                .and_then(|n| n.attribute("host"))
            {
                for copy in allocation.routing_nodes().assigned_copies(&shard.shard_id) {
                    let Some(holder) = copy.current_node.as_deref() else {
                        continue;
                    };
                    if holder == node.node_id() {
                        continue;
                    }
                    let holder_host = allocation
                        .nodes()
                        .get(holder)
                        .and_then(|n| n.attribute("host"));
                    if holder_host == Some(host) {
                        return DeciderVerdict::no(format!(
                            "a copy of {} already exists on host {} (node {})",
                            shard.shard_id, host, holder
                        ));
                    }
                }
            }
        }

        DeciderVerdict::yes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::RoutingAllocation;
    use crate::cluster::{ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata};
    use crate::deciders::{AllocationDeciders, Decision};
    use crate::info::ClusterInfo;
    use crate::routing::RoutingTable;
    use crate::settings::AllocationSettings;

    fn make_state(nodes: Vec<DiscoveryNode>) -> ClusterState {
        let meta = IndexMetadata::new("logs", 1, 1);
        let mut table = RoutingTable::new(0);
        table.add_index_as_new(&meta, 0, 0);
        ClusterState::new(
            "test",
            1,
            DiscoveryNodes::new(nodes),
            Metadata::new([meta]),
            table,
        )
    }

    #[test]
    fn test_refuses_second_copy_on_same_node() {
        let state = make_state(vec![DiscoveryNode::new("node-1")]);
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        // Put the primary on node-1
        let primary = allocation
            .routing_nodes_mut()
            .unassigned_mut()
            .remove_first(|s| s.primary)
            .unwrap();
        allocation
            .routing_nodes_mut()
            .initialize(primary, "node-1", None, -1)
            .unwrap();

        let replica = allocation
            .routing_nodes()
            .unassigned()
            .iter()
            .next()
            .unwrap()
            .clone();
        let node = allocation.routing_nodes().node("node-1").unwrap();
        let verdict = SameShardDecider.can_allocate(&replica, node, &allocation);
        assert_eq!(verdict.decision, Decision::No);
    }

    #[test]
    fn test_refuses_same_host() {
        let state = make_state(vec![
            DiscoveryNode::new("node-1").with_attribute("host", "box-1"),
            DiscoveryNode::new("node-2").with_attribute("host", "box-1"),
        ]);
        let deciders = AllocationDeciders::new(vec![]);
        let mut settings = AllocationSettings::default();
        settings.same_shard_host = true;
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        let primary = allocation
            .routing_nodes_mut()
            .unassigned_mut()
            .remove_first(|s| s.primary)
            .unwrap();
        allocation
            .routing_nodes_mut()
            .initialize(primary, "node-1", None, -1)
            .unwrap();

        let replica = allocation
            .routing_nodes()
            .unassigned()
            .iter()
            .next()
            .unwrap()
            .clone();
        let node = allocation.routing_nodes().node("node-2").unwrap();
        let verdict = SameShardDecider.can_allocate(&replica, node, &allocation);
        assert_eq!(verdict.decision, Decision::No);
    }
}
