//! Allocation-specific error types
//!
//! Throttled placements and pending store fetches are not errors; they are
//! reported through `AllocationStatus` on the unassigned shard. Only inputs
//! that must reject the whole batch surface here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while applying events or commands to a cluster state
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum AllocationError {
    /// The event batch referenced shards or nodes that do not exist, or
    /// contained duplicates. Nothing was applied.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A routing invariant was broken by the pass. Programming error; the
    /// produced state must be discarded.
    #[error("Routing invariant violated: {0}")]
    InvariantViolation(String),

    /// An administrative command failed a precondition or was refused by a
    /// decider. The command batch is atomic; none of it was applied.
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    #[error("Unknown index: {0}")]
    UnknownIndex(String),
}

impl AllocationError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            AllocationError::InvalidInput(_) => "invalid_input",
            AllocationError::InvariantViolation(_) => "invariant_violation",
            AllocationError::CommandRejected(_) => "command_rejected",
            AllocationError::UnknownIndex(_) => "unknown_index",
        }
    }
}

pub type Result<T> = std::result::Result<T, AllocationError>;
