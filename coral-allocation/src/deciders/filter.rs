//! Node attribute filters

use super::{AllocationDecider, DeciderVerdict};
use crate::allocation::RoutingAllocation;
use crate::cluster::DiscoveryNode;
use crate::routing::{RoutingNode, ShardRouting};
use crate::settings::AllocationFilters;

/// Enforces require/include/exclude attribute filters, both cluster-level and
/// per-index. A shard may neither land on nor remain on a filtered-out node.
pub struct FilterDecider;

fn violation(filters: &AllocationFilters, node: &DiscoveryNode) -> Option<String> {
    for (key, value) in &filters.require {
        if node.attribute(key) != Some(value.as_str()) {
            return Some(format!(
                "node does not match require filter [{}={}]",
                key, value
            ));
        }
    }
    if !filters.include.is_empty() {
        let matched = filters
            .include
            .iter()
            .any(|(key, value)| node.attribute(key) == Some(value.as_str()));
        if !matched {
            return Some("node matches no include filter".to_string());
        }
    }
    for (key, value) in &filters.exclude {
        if node.attribute(key) == Some(value.as_str()) {
            return Some(format!("node matches exclude filter [{}={}]", key, value));
        }
    }
    None
}

impl FilterDecider {
    fn check(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        let Some(live) = allocation.nodes().get(node.node_id()) else {
            return DeciderVerdict::no(format!(
                "node {} is not part of the cluster",
                node.node_id()
            ));
        };

        if let Some(reason) = violation(&allocation.settings().filters, live) {
            return DeciderVerdict::no(format!("cluster filter: {}", reason));
        }
        if let Some(meta) = allocation.metadata().index(shard.shard_id.index_name()) {
            if let Some(reason) = violation(&meta.filters, live) {
                return DeciderVerdict::no(format!(
                    "index [{}] filter: {}",
                    shard.shard_id.index_name(),
                    reason
                ));
            }
        }
        DeciderVerdict::yes()
    }
}

impl AllocationDecider for FilterDecider {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        self.check(shard, node, allocation)
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        self.check(shard, node, allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_filters(
        require: &[(&str, &str)],
        include: &[(&str, &str)],
        exclude: &[(&str, &str)],
    ) -> AllocationFilters {
        let to_map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        AllocationFilters {
            require: to_map(require),
            include: to_map(include),
            exclude: to_map(exclude),
        }
    }

    #[test]
    fn test_require_filter() {
        let node = DiscoveryNode::new("node-1").with_attribute("tier", "hot");
        assert!(violation(&make_filters(&[("tier", "hot")], &[], &[]), &node).is_none());
        assert!(violation(&make_filters(&[("tier", "cold")], &[], &[]), &node).is_some());
    }

    #[test]
    fn test_include_filter() {
        let node = DiscoveryNode::new("node-1").with_attribute("zone", "zone-a");
        assert!(violation(&make_filters(&[], &[("zone", "zone-a")], &[]), &node).is_none());
        assert!(violation(&make_filters(&[], &[("zone", "zone-b")], &[]), &node).is_some());
    }

    #[test]
    fn test_exclude_filter() {
        let node = DiscoveryNode::new("node-1").with_attribute("zone", "zone-a");
        assert!(violation(&make_filters(&[], &[], &[("zone", "zone-a")]), &node).is_some());
        assert!(violation(&make_filters(&[], &[], &[("zone", "zone-b")]), &node).is_none());
    }
}
