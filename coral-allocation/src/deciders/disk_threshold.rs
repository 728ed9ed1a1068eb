//! Disk watermark enforcement

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// Keeps shards off nodes whose disk usage crosses the configured watermarks.
/// Nodes with no usage data are treated permissively; the information oracle
/// is best-effort by contract.
pub struct DiskThresholdDecider;

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        "disk_threshold"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        let Some(usage) = allocation.info().disk_usage(node.node_id()) else {
            return DeciderVerdict::yes();
        };
        let watermarks = allocation.settings().disk;
        let current = usage.used_fraction();

        if current >= watermarks.flood_stage {
            return DeciderVerdict::no(format!(
                "node {} exceeds the flood stage watermark ({:.0}% used, flood stage {:.0}%)",
                node.node_id(),
                current * 100.0,
                watermarks.flood_stage * 100.0
            ));
        }
        if current >= watermarks.low {
            return DeciderVerdict::no(format!(
                "node {} exceeds the low disk watermark ({:.0}% used, watermark {:.0}%)",
                node.node_id(),
                current * 100.0,
                watermarks.low * 100.0
            ));
        }

        let size = allocation
            .info()
            .shard_size(&shard.shard_id)
            .unwrap_or(shard.expected_size_bytes);
        let projected = usage.used_fraction_after(size);
        if projected >= watermarks.high {
            return DeciderVerdict::no(format!(
                "allocating {} ({} bytes) onto node {} would exceed the high watermark ({:.0}% projected)",
                shard.shard_id,
                size.max(0),
                node.node_id(),
                projected * 100.0
            ));
        }

        DeciderVerdict::yes()
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        let Some(usage) = allocation.info().disk_usage(node.node_id()) else {
            return DeciderVerdict::yes();
        };
        let watermarks = allocation.settings().disk;
        let current = usage.used_fraction();

        if current >= watermarks.high {
            return DeciderVerdict::no(format!(
                "shard {} should leave node {}: {:.0}% used exceeds the high watermark ({:.0}%)",
                shard.shard_id,
                node.node_id(),
                current * 100.0,
                watermarks.high * 100.0
            ));
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
    use crate::info::{ClusterInfo, DiskUsage};
    use crate::routing::RoutingTable;
    use crate::settings::AllocationSettings;

    fn make_state() -> ClusterState {
        let meta = IndexMetadata::new("logs", 1, 1);
        let mut table = RoutingTable::new(0);
        table.add_index_as_new(&meta, 0, 0);
        ClusterState::new(
            "test",
            1,
            DiscoveryNodes::new([DiscoveryNode::new("node-1")]),
            Metadata::new([meta]),
            table,
        )
    }

    #[test]
    fn test_refuses_above_low_watermark() {
        let state = make_state();
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let info = ClusterInfo::new().with_disk_usage("node-1", DiskUsage::new(100, 92));
        let allocation = RoutingAllocation::new(&deciders, &state, &settings, info, 0, 0);

        let shard = allocation.routing_nodes().unassigned().iter().next().unwrap().clone();
        let node = allocation.routing_nodes().node("node-1").unwrap();
        let verdict = DiskThresholdDecider.can_allocate(&shard, node, &allocation);
        assert_eq!(verdict.decision, Decision::No);
        assert!(verdict.reason.unwrap().contains("watermark"));
    }

    #[test]
    fn test_permissive_without_usage_data() {
        let state = make_state();
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        let shard = allocation.routing_nodes().unassigned().iter().next().unwrap().clone();
        let node = allocation.routing_nodes().node("node-1").unwrap();
        let verdict = DiskThresholdDecider.can_allocate(&shard, node, &allocation);
        assert_eq!(verdict.decision, Decision::Yes);
    }

    #[test]
    fn test_projected_size_trips_high_watermark() {
        let state = make_state();
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let shard_id = state
            .routing_table
            .all_shards()
            .next()
            .unwrap()
            .shard_id
            .clone();
        let info = ClusterInfo::new()
            .with_disk_usage("node-1", DiskUsage::new(100, 80))
            .with_shard_size(shard_id, 15);
        let allocation = RoutingAllocation::new(&deciders, &state, &settings, info, 0, 0);

        let shard = allocation.routing_nodes().unassigned().iter().next().unwrap().clone();
        let node = allocation.routing_nodes().node("node-1").unwrap();
        // 80% now, 95% projected: above the 90% high watermark
        let verdict = DiskThresholdDecider.can_allocate(&shard, node, &allocation);
        assert_eq!(verdict.decision, Decision::No);

        // But the shard may remain below the high watermark
        let verdict = DiskThresholdDecider.can_remain(&shard, node, &allocation);
        assert_eq!(verdict.decision, Decision::Yes);
    }
}
