//! Per-node shard count cap

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// Enforces the cluster-wide cap on shards per node, when configured.
pub struct ShardsLimitDecider;

impl AllocationDecider for ShardsLimitDecider {
    fn name(&self) -> &'static str {
        "shards_limit"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        let Some(limit) = allocation.settings().max_shards_per_node else {
            return DeciderVerdict::yes();
        };
        let held = node.shard_count();
        if held >= limit {
            return DeciderVerdict::no(format!(
                "node {} holds {} shards, at the configured cap of {}",
                node.node_id(),
                held,
                limit
            ));
        }
        DeciderVerdict::yes()
    }
}
