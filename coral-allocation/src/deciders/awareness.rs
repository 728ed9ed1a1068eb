//! Failure-domain awareness

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};
use std::collections::{BTreeMap, BTreeSet};

/// Spreads copies of a shard across the values of configured node attributes
/// (zone, rack). A node may not take a copy when its attribute value would
/// hold more than its balanced share of the group.
pub struct AwarenessDecider;

impl AllocationDecider for AwarenessDecider {
    fn name(&self) -> &'static str {
        "awareness"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        let attributes = &allocation.settings().awareness_attributes;
        if attributes.is_empty() {
            return DeciderVerdict::yes();
        }

        let Some(meta) = allocation.metadata().index(shard.shard_id.index_name()) else {
            return DeciderVerdict::yes();
        };
        let total_copies = meta.total_copies() as usize;

        for attribute in attributes {
            let Some(node_value) = allocation
                .nodes()
                .get(node.node_id())
                .and_then(|n| n.attribute(attribute))
            else {
                return DeciderVerdict::no(format!(
                    "node {} has no value for awareness attribute [{}]",
                    node.node_id(),
                    attribute
                ));
            };

            // Distinct values available across live data nodes
            let values: BTreeSet<&str> = allocation
                .nodes()
                .data_nodes()
                .filter_map(|n| n.attribute(attribute))
                .collect();
            if values.is_empty() {
                continue;
            }

            // Copies per value, counting relocations at their destination and
            // this prospective assignment on its node
            let mut per_value: BTreeMap<&str, usize> = BTreeMap::new();
            *per_value.entry(node_value).or_insert(0) += 1;
            for copy in allocation.routing_nodes().assigned_copies(&shard.shard_id) {
                if copy.is_relocation_target() {
                    continue;
                }
                let effective_node = copy
                    .relocating_node
                    .as_deref()
                    .filter(|_| copy.is_relocating())
                    .or(copy.current_node.as_deref());
                let Some(value) = effective_node
                    .and_then(|n| allocation.nodes().get(n))
                    .and_then(|n| n.attribute(attribute))
                else {
                    continue;
                };
                *per_value.entry(value).or_insert(0) += 1;
            }

            let required = total_copies.div_ceil(values.len());
            let assigned_here = per_value.get(node_value).copied().unwrap_or(0);
            if assigned_here > required {
                return DeciderVerdict::no(format!(
                    "too many copies of {} would live in [{}={}]: {} while only {} per value are balanced",
                    shard.shard_id, attribute, node_value, assigned_here, required
                ));
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

    fn make_state() -> ClusterState {
        let meta = IndexMetadata::new("logs", 1, 1);
        let mut table = RoutingTable::new(0);
        table.add_index_as_new(&meta, 0, 0);
        ClusterState::new(
            "test",
            1,
            DiscoveryNodes::new([
                DiscoveryNode::new("node-1").with_attribute("zone", "zone-a"),
                DiscoveryNode::new("node-2").with_attribute("zone", "zone-a"),
                DiscoveryNode::new("node-3").with_attribute("zone", "zone-b"),
            ]),
            Metadata::new([meta]),
            table,
        )
    }

    #[test]
    fn test_refuses_second_copy_in_same_zone() {
        let state = make_state();
        let deciders = AllocationDeciders::new(vec![]);
        let mut settings = AllocationSettings::default();
        settings.awareness_attributes = vec!["zone".to_string()];
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

        // Same zone as the primary: refused
        let node2 = allocation.routing_nodes().node("node-2").unwrap();
        let verdict = AwarenessDecider.can_allocate(&replica, node2, &allocation);
        assert_eq!(verdict.decision, Decision::No);

        // Other zone: allowed
        let node3 = allocation.routing_nodes().node("node-3").unwrap();
        let verdict = AwarenessDecider.can_allocate(&replica, node3, &allocation);
        assert_eq!(verdict.decision, Decision::Yes);
    }

    #[test]
    fn test_disabled_without_attributes() {
        let state = make_state();
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        let replica = allocation
            .routing_nodes()
            .unassigned()
            .iter()
            .find(|s| !s.primary)
            .unwrap()
            .clone();
        let node = allocation.routing_nodes().node("node-1").unwrap();
        let verdict = AwarenessDecider.can_allocate(&replica, node, &allocation);
        assert_eq!(verdict.decision, Decision::Yes);
    }
}
