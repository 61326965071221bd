use std::collections::HashSet;

use kapt_core::{BidSnapshot, SelectionEntry, SelectionSet, SyncReport};
use tracing::warn;

/// Inconsistency found in a stored selection set. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationIntegrityWarning {
    /// `check_order` names an id with no entry.
    OrderedWithoutEntry { id: String },
    /// `check_order` names the same id more than once.
    DuplicateInOrder { id: String },
    /// An entry that `check_order` never mentions.
    EntryNotOrdered { id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub selection: SelectionSet,
    pub report: SyncReport,
    pub warnings: Vec<ReconciliationIntegrityWarning>,
}

/// Carry the user's selection forward onto a freshly assembled snapshot.
///
/// Entries whose notice left the catalog, or whose post date moved, are
/// dropped. Survivors take the new canonical record and keep their
/// annotation untouched, in their original `check_order` position.
/// Updated and unchanged are judged on the canonical listing fields
/// (`BidRecord::same_listing`), so `scraped_at` alone never counts.
///
/// Ids that are newly listed but were already selected are classified like
/// any other survivor, then removed as stale and counted as invalid too.
pub fn reconcile(
    old_snapshot: &BidSnapshot,
    new_snapshot: &BidSnapshot,
    old_selection: &SelectionSet,
) -> Reconciliation {
    let old_index = old_snapshot.by_id();
    let new_index = new_snapshot.by_id();

    let newly_added: Vec<&str> = new_snapshot
        .records
        .iter()
        .map(|r| r.id.as_str())
        .filter(|id| !old_index.contains_key(id))
        .collect();
    let stale: HashSet<&str> = newly_added
        .iter()
        .copied()
        .filter(|id| old_selection.entries.contains_key(*id))
        .collect();

    let mut report = SyncReport {
        total_bids: new_snapshot.len(),
        newly_added: newly_added.len(),
        invalid_selections_removed: stale.len(),
        ..SyncReport::default()
    };
    let mut warnings = Vec::new();
    let mut selection = SelectionSet::default();
    let mut visited: HashSet<&str> = HashSet::with_capacity(old_selection.check_order.len());

    for id in &old_selection.check_order {
        if !visited.insert(id.as_str()) {
            warnings.push(ReconciliationIntegrityWarning::DuplicateInOrder { id: id.clone() });
            continue;
        }
        let Some(entry) = old_selection.entries.get(id) else {
            warnings.push(ReconciliationIntegrityWarning::OrderedWithoutEntry { id: id.clone() });
            continue;
        };
        let Some(&current) = new_index.get(id.as_str()) else {
            report.removed_from_selection += 1;
            continue;
        };
        let previous = old_index.get(id.as_str()).copied();
        if previous.is_some_and(|prev| prev.post_date != current.post_date) {
            report.removed_from_selection += 1;
            continue;
        }

        if previous.unwrap_or(&entry.record).same_listing(current) {
            report.unchanged_in_selection += 1;
        } else {
            report.updated_in_selection += 1;
        }
        if stale.contains(id.as_str()) {
            continue;
        }
        selection.insert(SelectionEntry {
            record: current.clone(),
            annotation: entry.annotation.clone(),
        });
    }

    let mut unordered: Vec<&String> = old_selection
        .entries
        .keys()
        .filter(|id| !visited.contains(id.as_str()))
        .collect();
    unordered.sort();
    warnings.extend(
        unordered
            .into_iter()
            .map(|id| ReconciliationIntegrityWarning::EntryNotOrdered { id: id.clone() }),
    );

    for warning in &warnings {
        warn!(?warning, "selection integrity problem skipped");
    }

    Reconciliation {
        selection,
        report,
        warnings,
    }
}
