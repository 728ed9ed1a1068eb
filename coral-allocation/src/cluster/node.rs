//! Cluster node descriptors
//!
//! Nodes are inputs to allocation: the live set with roles and attributes.
//! Discovery itself happens elsewhere; by the time a snapshot reaches this
//! crate the membership question is settled.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Eligible to hold shard data
    Data,
    /// Eligible to coordinate cluster state
    Master,
    /// Runs ingest pipelines
    Ingest,
}

/// A single known node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Unique node identifier
    pub node_id: String,

    /// Human-readable name
    pub name: String,

    /// Roles this node carries
    pub roles: BTreeSet<NodeRole>,

    /// Arbitrary attributes (zone, rack, host, disk type) used by deciders
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DiscoveryNode {
    /// Create a data+master node with no attributes
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            name: node_id.to_string(),
            roles: [NodeRole::Data, NodeRole::Master].into_iter().collect(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style: set an attribute
    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Builder-style: restrict roles
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn is_data_node(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }
}

/// The live node set of a cluster state snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<String, DiscoveryNode>,
}

impl DiscoveryNodes {
    pub fn new(nodes: impl IntoIterator<Item = DiscoveryNode>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|n| (n.node_id.clone(), n))
                .collect(),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    /// Nodes eligible to hold shard data, in id order
    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_data_node())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roles() {
        let node = DiscoveryNode::new("node-1");
        assert!(node.is_data_node());
        assert!(node.roles.contains(&NodeRole::Master));
    }

    #[test]
    fn test_data_node_filter() {
        let nodes = DiscoveryNodes::new([
            DiscoveryNode::new("node-1"),
            DiscoveryNode::new("node-2").with_roles([NodeRole::Master]),
        ]);

        let data: Vec<_> = nodes.data_nodes().map(|n| n.node_id.as_str()).collect();
        assert_eq!(data, vec!["node-1"]);
    }

    #[test]
    fn test_attributes() {
        let node = DiscoveryNode::new("node-1")
            .with_attribute("zone", "zone-a")
            .with_attribute("host", "rack7-box2");

        assert_eq!(node.attribute("zone"), Some("zone-a"));
        assert_eq!(node.attribute("rack"), None);
    }
}
