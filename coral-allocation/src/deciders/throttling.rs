//! Recovery concurrency caps

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// Caps concurrent recoveries per node: incoming initializations when
/// allocating, outgoing relocations when rebalancing. THROTTLE is not a
/// refusal; the shard is retried on a later pass.
pub struct ThrottlingDecider;

impl AllocationDecider for ThrottlingDecider {
    fn name(&self) -> &'static str {
        "throttling"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        let cap = allocation.settings().node_concurrent_incoming_recoveries;
        let incoming = node.incoming_recoveries();
        if incoming >= cap {
            return DeciderVerdict::throttle(format!(
                "node {} already has {} incoming recoveries (cap {})",
                node.node_id(),
                incoming,
                cap
            ));
        }
        DeciderVerdict::yes()
    }

    fn can_rebalance(
        &self,
        shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        let cap = allocation.settings().node_concurrent_outgoing_recoveries;
        let Some(node_id) = shard.current_node.as_deref() else {
            return DeciderVerdict::yes();
        };
        let outgoing = allocation
            .routing_nodes()
            .node(node_id)
            .map(|n| n.outgoing_recoveries())
            .unwrap_or(0);
        if outgoing >= cap {
            return DeciderVerdict::throttle(format!(
                "node {} already has {} outgoing recoveries (cap {})",
                node_id, outgoing, cap
            ));
        }
        DeciderVerdict::yes()
    }
}
