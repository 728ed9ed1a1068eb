//! Per-index metadata
//!
//! Metadata is the durable half of cluster state: shard geometry, allocation
//! filters, the in-sync allocation id sets and primary terms that routing
//! changes must be reconciled against at commit.

use crate::error::{AllocationError, Result};
use crate::settings::AllocationFilters;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Index identity: name plus a uuid that survives re-creation under the same name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub uuid: String,
}

impl Index {
    pub fn new(name: &str, uuid: &str) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid.to_string(),
        }
    }

    /// Create with a fresh uuid
    pub fn with_fresh_uuid(name: &str) -> Self {
        Self::new(name, &uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Metadata of a single index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub index: Index,

    /// Number of primary shards; fixed for the life of the index
    pub number_of_shards: u32,

    /// Replicas per primary
    pub number_of_replicas: u32,

    /// How long to hold off re-allocating shards after their node left
    #[serde(default)]
    pub delayed_node_left_timeout_millis: u64,

    /// Index-level allocation filters, layered on top of the cluster-level ones
    #[serde(default)]
    pub filters: AllocationFilters,

    /// Allocation ids of in-sync copies, per shard number
    #[serde(default)]
    pub in_sync_allocations: BTreeMap<u32, BTreeSet<String>>,

    /// Primary term per shard number; bumped on promotion or fresh assignment
    #[serde(default)]
    pub primary_terms: Vec<u64>,
}

impl IndexMetadata {
    /// Create metadata for a new index; terms start at zero and are bumped to
    /// one when the first primary is assigned.
    pub fn new(name: &str, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            index: Index::with_fresh_uuid(name),
            number_of_shards,
            number_of_replicas,
            delayed_node_left_timeout_millis: 0,
            filters: AllocationFilters::default(),
            in_sync_allocations: BTreeMap::new(),
            primary_terms: vec![0; number_of_shards as usize],
        }
    }

    /// Builder-style: set the delayed node-left timeout
    pub fn with_delayed_node_left_timeout(mut self, timeout: Duration) -> Self {
        self.delayed_node_left_timeout_millis = timeout.as_millis() as u64;
        self
    }

    /// Builder-style: set index-level filters
    pub fn with_filters(mut self, filters: AllocationFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn delayed_node_left_timeout(&self) -> Duration {
        Duration::from_millis(self.delayed_node_left_timeout_millis)
    }

    pub fn primary_term(&self, shard_number: u32) -> u64 {
        self.primary_terms
            .get(shard_number as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn in_sync_ids(&self, shard_number: u32) -> Option<&BTreeSet<String>> {
        self.in_sync_allocations.get(&shard_number)
    }

    /// Total copies per shard group (primary + replicas)
    pub fn total_copies(&self) -> u32 {
        1 + self.number_of_replicas
    }
}

/// All index metadata of a cluster state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Metadata {
    indices: BTreeMap<String, IndexMetadata>,
}

impl Metadata {
    pub fn new(indices: impl IntoIterator<Item = IndexMetadata>) -> Self {
        Self {
            indices: indices
                .into_iter()
                .map(|m| (m.index.name.clone(), m))
                .collect(),
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    /// Look up metadata, failing with `UnknownIndex` when absent
    pub fn index_required(&self, name: &str) -> Result<&IndexMetadata> {
        self.indices
            .get(name)
            .ok_or_else(|| AllocationError::UnknownIndex(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Replace one index entry, returning a new metadata value
    pub(crate) fn with_index(&self, meta: IndexMetadata) -> Self {
        let mut indices = self.indices.clone();
        indices.insert(meta.index.name.clone(), meta);
        Self { indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_index_terms_start_at_zero() {
        let meta = IndexMetadata::new("logs", 3, 1);
        assert_eq!(meta.primary_terms, vec![0, 0, 0]);
        assert_eq!(meta.primary_term(2), 0);
        assert_eq!(meta.total_copies(), 2);
        assert!(meta.in_sync_ids(0).is_none());
    }

    #[test]
    fn test_delayed_timeout_roundtrip() {
        let meta = IndexMetadata::new("logs", 1, 0)
            .with_delayed_node_left_timeout(Duration::from_secs(60));
        assert_eq!(meta.delayed_node_left_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_metadata_lookup() {
        let metadata = Metadata::new([IndexMetadata::new("logs", 1, 1)]);
        assert!(metadata.index("logs").is_some());
        assert!(metadata.index_required("missing").is_err());
    }

    #[test]
    fn test_with_index_replaces_entry() {
        let metadata = Metadata::new([IndexMetadata::new("logs", 1, 1)]);
        let mut updated = metadata.index("logs").unwrap().clone();
        updated.primary_terms[0] = 7;

        let next = metadata.with_index(updated);
        assert_eq!(next.index("logs").unwrap().primary_term(0), 7);
        // Original untouched
        assert_eq!(metadata.index("logs").unwrap().primary_term(0), 0);
    }
}
