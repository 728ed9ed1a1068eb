//! Allocation identifiers
//!
//! Every assigned shard copy carries an opaque id minted at initialization.
//! During relocation the source and target each carry both halves of the
//! handshake so the target can be promoted atomically when it starts.

use serde::{Deserialize, Serialize};

/// Identity of one shard copy incarnation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationId {
    /// Id of this copy
    pub id: String,

    /// For a relocation source: the target's id. For a relocation target: the
    /// source's id. Absent outside relocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocation_id: Option<String>,
}

impl AllocationId {
    /// Mint a fresh id for a newly initializing shard
    pub fn fresh() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            relocation_id: None,
        }
    }

    /// Reuse an id recovered from an existing on-disk copy
    pub fn existing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            relocation_id: None,
        }
    }

    /// Source half of a relocation handshake: keeps its own id, records the
    /// freshly minted target id.
    pub fn as_relocation_source(&self, target_id: &str) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: Some(target_id.to_string()),
        }
    }

    /// Target half of a relocation handshake
    pub fn relocation_target(source: &AllocationId, target_id: &str) -> Self {
        Self {
            id: target_id.to_string(),
            relocation_id: Some(source.id.clone()),
        }
    }

    /// Drop the relocation pairing, keeping the id
    pub fn without_relocation(&self) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_unique() {
        assert_ne!(AllocationId::fresh().id, AllocationId::fresh().id);
    }

    #[test]
    fn test_relocation_pairing() {
        let source = AllocationId::existing("src");
        let paired_source = source.as_relocation_source("tgt");
        let target = AllocationId::relocation_target(&source, "tgt");

        assert_eq!(paired_source.id, "src");
        assert_eq!(paired_source.relocation_id.as_deref(), Some("tgt"));
        assert_eq!(target.id, "tgt");
        assert_eq!(target.relocation_id.as_deref(), Some("src"));

        let completed = target.without_relocation();
        assert_eq!(completed.id, "tgt");
        assert!(completed.relocation_id.is_none());
    }
}
