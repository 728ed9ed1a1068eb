//! Failed-allocation retry limit

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// Stops re-trying shards that keep failing to allocate. A reroute issued
/// with `retry_failed` resets the gate so operators can force another round
/// after fixing the underlying problem.
pub struct MaxRetryDecider;

impl AllocationDecider for MaxRetryDecider {
    fn name(&self) -> &'static str {
        "max_retry"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        if allocation.retry_failed() {
            return DeciderVerdict::yes();
        }
        let Some(info) = shard.unassigned_info.as_ref() else {
            return DeciderVerdict::yes();
        };
        let max_retries = allocation.settings().max_retries;
        if info.failed_allocations >= max_retries {
            return DeciderVerdict::no(format!(
                "shard {} has failed allocation {} times (limit {}); retry with retry_failed",
                shard.shard_id, info.failed_allocations, max_retries
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
    use crate::info::ClusterInfo;
    use crate::routing::RoutingTable;
    use crate::settings::AllocationSettings;

    fn decision(failed: u32, retry_failed: bool) -> Decision {
        let meta = IndexMetadata::new("logs", 1, 0);
        let mut table = RoutingTable::new(0);
        table.add_index_as_new(&meta, 0, 0);
        let state = ClusterState::new(
            "test",
            1,
            DiscoveryNodes::new([DiscoveryNode::new("node-1")]),
            Metadata::new([meta]),
            table,
        );
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);
        allocation.set_retry_failed(retry_failed);

        let mut shard = allocation.routing_nodes().unassigned().iter().next().unwrap().clone();
        shard.unassigned_info.as_mut().unwrap().failed_allocations = failed;
        let node = allocation.routing_nodes().node("node-1").unwrap();
        MaxRetryDecider.can_allocate(&shard, node, &allocation).decision
    }

    #[test]
    fn test_limit() {
        assert_eq!(decision(0, false), Decision::Yes);
        assert_eq!(decision(4, false), Decision::Yes);
        assert_eq!(decision(5, false), Decision::No);
        assert_eq!(decision(12, false), Decision::No);
    }

    #[test]
    fn test_retry_failed_resets_the_gate() {
        assert_eq!(decision(12, true), Decision::Yes);
    }
}
