//! Replica recovery ordering

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// A replica recovers from its primary, so it may only initialize once the
/// primary is active. The target half of a primary relocation is exempt; its
/// recovery source is the relocating primary itself.
pub struct ReplicaAfterPrimaryDecider;

impl AllocationDecider for ReplicaAfterPrimaryDecider {
    fn name(&self) -> &'static str {
        "replica_after_primary"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        if shard.primary {
            return DeciderVerdict::yes();
        }
        if allocation.routing_nodes().active_primary(&shard.shard_id).is_none() {
            return DeciderVerdict::no(format!(
                "primary of {} is not active",
                shard.shard_id
            ));
        }
        DeciderVerdict::yes()
    }
}
