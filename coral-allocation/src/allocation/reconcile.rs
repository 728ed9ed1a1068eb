//! Metadata reconciliation at commit
//!
//! After a pass mutates routing, index metadata must follow: the in-sync
//! allocation id sets track which copies are started, and primary terms bump
//! whenever a different copy becomes primary other than by completing a
//! relocation. Returns the original metadata object when nothing changed so
//! callers can short-circuit.

use crate::cluster::{IndexMetadata, Metadata};
use crate::error::{AllocationError, Result};
use crate::routing::RoutingTable;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Derive the metadata matching `new_table`
pub fn reconcile(
    old_metadata: &Arc<Metadata>,
    old_table: &RoutingTable,
    new_table: &RoutingTable,
) -> Result<Arc<Metadata>> {
    let mut result: Option<Metadata> = None;

    for index_table in new_table.iter() {
        let meta = old_metadata.index_required(&index_table.index.name)?;
        let mut updated: Option<IndexMetadata> = None;

        for group in index_table.iter() {
            let number = group.shard_id.id;

            // In-sync allocation ids follow the started copies. An empty set is
            // never written; losing every copy transiently must not forget
            // which ids were valid.
            let active: BTreeSet<String> = group
                .iter()
                .filter(|s| s.is_started())
                .filter_map(|s| s.allocation_id_str().map(|id| id.to_string()))
                .collect();
            let stored = meta.in_sync_ids(number);
            if !active.is_empty() && stored != Some(&active) {
                updated
                    .get_or_insert_with(|| meta.clone())
                    .in_sync_allocations
                    .insert(number, active);
            }

            // Primary term
            let new_primary = group.primary().ok_or_else(|| {
                AllocationError::InvariantViolation(format!(
                    "shard {} has no primary entry",
                    group.shard_id
                ))
            })?;
            let old_primary = old_table
                .shard_group(&group.shard_id)
                .and_then(|g| g.primary())
                .ok_or_else(|| {
                    AllocationError::InvariantViolation(format!(
                        "shard {} has no primary entry in the previous table",
                        group.shard_id
                    ))
                })?;

            let relocation_completed = old_primary.is_relocating()
                && old_primary
                    .allocation_id
                    .as_ref()
                    .and_then(|a| a.relocation_id.as_deref())
                    .is_some_and(|target| new_primary.allocation_id_str() == Some(target));

            let bump = !new_primary.is_unassigned()
                && !new_primary.is_same_allocation(old_primary)
                && !relocation_completed;

            if bump {
                let target = updated.get_or_insert_with(|| meta.clone());
                let term = target
                    .primary_terms
                    .get_mut(number as usize)
                    .ok_or_else(|| {
                        AllocationError::InvariantViolation(format!(
                            "shard {} has no primary term slot",
                            group.shard_id
                        ))
                    })?;
                *term += 1;
                debug!(shard = %group.shard_id, term = *term, "bumped primary term");
            }
        }

        if let Some(new_meta) = updated {
            let base = result.take().unwrap_or_else(|| (**old_metadata).clone());
            result = Some(base.with_index(new_meta));
        }
    }

    Ok(match result {
        Some(metadata) => Arc::new(metadata),
        None => Arc::clone(old_metadata),
    })
}
