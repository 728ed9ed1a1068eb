//! Decision explanations for the admin surface

use crate::deciders::DeciderDecision;
use serde::{Deserialize, Serialize};

/// Decisions recorded for one subject: a command or an unassigned shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationEntry {
    /// What was being decided, e.g. `move logs[0] node-1 -> node-2`
    pub subject: String,

    /// Per-decider verdicts, in stack order
    pub decisions: Vec<DeciderDecision>,
}

/// Ordered log of every explained decision in one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoutingExplanations {
    entries: Vec<ExplanationEntry>,
}

impl RoutingExplanations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subject: String, decisions: Vec<DeciderDecision>) {
        self.entries.push(ExplanationEntry { subject, decisions });
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExplanationEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any recorded decision names the given decider
    pub fn mentions_decider(&self, decider: &str) -> bool {
        self.entries
            .iter()
            .flat_map(|e| e.decisions.iter())
            .any(|d| d.decider == decider)
    }

    /// Render for the explain API
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.entries).unwrap_or_else(|_| serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deciders::Decision;

    #[test]
    fn test_json_rendering() {
        let mut explanations = RoutingExplanations::new();
        explanations.push(
            "allocate_replica logs[0] on node-2".to_string(),
            vec![DeciderDecision {
                decider: "disk_threshold".to_string(),
                decision: Decision::No,
                message: Some("node node-2 exceeds the low disk watermark".to_string()),
            }],
        );

        assert_eq!(explanations.len(), 1);
        assert!(explanations.mentions_decider("disk_threshold"));
        assert!(!explanations.mentions_decider("awareness"));

        let json = explanations.to_json();
        assert_eq!(json[0]["subject"], "allocate_replica logs[0] on node-2");
        assert_eq!(json[0]["decisions"][0]["decision"], "no");
    }
}
