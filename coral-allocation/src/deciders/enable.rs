//! Cluster-wide allocation gate

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting, UnassignedReason};
use crate::settings::AllocationEnable;

/// Honors the `enable` setting. Explicit administrative commands run with the
/// gate bypassed so operators can always intervene.
pub struct EnableDecider;

impl AllocationDecider for EnableDecider {
    fn name(&self) -> &'static str {
        "enable"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        if allocation.ignore_disable() {
            return DeciderVerdict::yes();
        }
        match allocation.settings().enable {
            AllocationEnable::All => DeciderVerdict::yes(),
            AllocationEnable::None => DeciderVerdict::no("allocation is disabled"),
            AllocationEnable::Primaries => {
                if shard.primary {
                    DeciderVerdict::yes()
                } else {
                    DeciderVerdict::no("replica allocation is disabled")
                }
            }
            AllocationEnable::NewPrimaries => {
                let new_index = shard
                    .unassigned_info
                    .as_ref()
                    .map(|i| i.reason == UnassignedReason::IndexCreated)
                    .unwrap_or(false);
                if shard.primary && new_index {
                    DeciderVerdict::yes()
                } else {
                    DeciderVerdict::no("only primaries of new indices may allocate")
                }
            }
        }
    }

    fn can_rebalance(
        &self,
        _shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        if allocation.settings().enable == AllocationEnable::None && !allocation.ignore_disable() {
            return DeciderVerdict::no("allocation is disabled");
        }
        DeciderVerdict::yes()
    }
}
