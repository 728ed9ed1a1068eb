//! Shard routing: the elementary unit of the routing table

use super::allocation_id::AllocationId;
use super::unassigned::UnassignedInfo;
use crate::cluster::Index;
use serde::{Deserialize, Serialize};

/// Identity of a shard group: index plus shard number
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub index: Index,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: Index, id: u32) -> Self {
        Self { index, id }
    }

    pub fn index_name(&self) -> &str {
        &self.index.name
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.index.name, self.id)
    }
}

/// Lifecycle state of a shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRoutingState {
    /// Not assigned to any node
    Unassigned,
    /// Assigned and recovering onto its node
    Initializing,
    /// Active and serving
    Started,
    /// Active, handing off to a target node
    Relocating,
}

impl ShardRoutingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardRoutingState::Unassigned => "unassigned",
            ShardRoutingState::Initializing => "initializing",
            ShardRoutingState::Started => "started",
            ShardRoutingState::Relocating => "relocating",
        }
    }
}

/// One copy of one shard, with its placement state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,

    /// Whether this copy is the primary
    pub primary: bool,

    pub state: ShardRoutingState,

    /// Node currently holding the copy; `None` iff unassigned
    pub current_node: Option<String>,

    /// Relocation peer: the target node for a relocating source, the source
    /// node for an initializing relocation target
    pub relocating_node: Option<String>,

    /// Identity of this copy; `None` iff unassigned
    pub allocation_id: Option<AllocationId>,

    /// Why and since when the copy is (or last was) unassigned
    pub unassigned_info: Option<UnassignedInfo>,

    /// Size hint for balancing; negative when unknown
    pub expected_size_bytes: i64,
}

impl ShardRouting {
    /// Size hint value meaning "unknown"
    pub const UNKNOWN_EXPECTED_SIZE: i64 = -1;

    /// Create a new unassigned copy
    pub fn new_unassigned(shard_id: ShardId, primary: bool, info: UnassignedInfo) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Unassigned,
            current_node: None,
            relocating_node: None,
            allocation_id: None,
            unassigned_info: Some(info),
            expected_size_bytes: Self::UNKNOWN_EXPECTED_SIZE,
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn is_initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    pub fn is_started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }

    pub fn is_relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating: the copy is serving
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ShardRoutingState::Started | ShardRoutingState::Relocating
        )
    }

    pub fn is_assigned(&self) -> bool {
        self.current_node.is_some()
    }

    /// Whether this is the initializing half of a relocation handshake
    pub fn is_relocation_target(&self) -> bool {
        self.state == ShardRoutingState::Initializing && self.relocating_node.is_some()
    }

    /// Allocation id string of this copy, if assigned
    pub fn allocation_id_str(&self) -> Option<&str> {
        self.allocation_id.as_ref().map(|a| a.id.as_str())
    }

    /// Whether both copies are the same incarnation
    pub fn is_same_allocation(&self, other: &ShardRouting) -> bool {
        match (&self.allocation_id, &other.allocation_id) {
            (Some(a), Some(b)) => a.id == b.id,
            _ => false,
        }
    }

    /// Whether this copy's id matches the relocation target of `source`
    pub fn is_relocation_target_of(&self, source: &ShardRouting) -> bool {
        match (&self.allocation_id, &source.allocation_id) {
            (Some(target), Some(src)) => src.relocation_id.as_deref() == Some(target.id.as_str()),
            _ => false,
        }
    }

    /// Short description for logs and explanations
    pub fn describe(&self) -> String {
        match (&self.current_node, &self.relocating_node) {
            (Some(node), Some(peer)) => format!(
                "[{}][{}][{}] on {} (peer {})",
                self.shard_id,
                if self.primary { "P" } else { "R" },
                self.state.as_str(),
                node,
                peer
            ),
            (Some(node), None) => format!(
                "[{}][{}][{}] on {}",
                self.shard_id,
                if self.primary { "P" } else { "R" },
                self.state.as_str(),
                node
            ),
            _ => format!(
                "[{}][{}][unassigned]",
                self.shard_id,
                if self.primary { "P" } else { "R" },
            ),
        }
    }
}
