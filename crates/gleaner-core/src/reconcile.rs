//! Set reconciliation between the ledger and a fresh gather pass.
//!
//! Pure logic, no I/O: the gather stage supplies both sets and turns the
//! result into ledger rows.

use std::collections::{BTreeSet, HashMap};

use crate::models::{EntryStatus, NewEntry};

/// The three disjoint buckets produced by [`reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Gathered but not currently known.
    pub new: BTreeSet<String>,
    /// Gathered and currently known.
    pub changed: BTreeSet<String>,
    /// Currently known but absent from this pass.
    pub deleted: BTreeSet<String>,
}

impl Reconciliation {
    /// True when no bucket holds anything.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Total number of entries this reconciliation will create.
    pub fn len(&self) -> usize {
        self.new.len() + self.changed.len() + self.deleted.len()
    }

    /// Builds the ledger rows for this reconciliation.
    ///
    /// `known` maps each currently known guid to the local entity id of its
    /// current entry, which `changed` and `deleted` rows carry forward.
    /// Rows come out in bucket order (new, changed, deleted), sorted by guid
    /// within each bucket.
    pub fn into_entries(self, known: &HashMap<String, Option<String>>) -> Vec<NewEntry> {
        let carried = |guid: &String| known.get(guid).cloned().flatten();
        let mut entries = Vec::with_capacity(self.len());

        entries.extend(self.new.into_iter().map(|guid| NewEntry {
            guid,
            status: EntryStatus::New,
            local_entity_id: None,
            current: true,
        }));
        entries.extend(self.changed.into_iter().map(|guid| NewEntry {
            local_entity_id: carried(&guid),
            guid,
            status: EntryStatus::Changed,
            current: true,
        }));
        entries.extend(self.deleted.into_iter().map(|guid| NewEntry {
            local_entity_id: carried(&guid),
            guid,
            status: EntryStatus::Deleted,
            current: false,
        }));

        entries
    }
}

/// Classifies every guid of `known_current` and `gathered` into exactly one bucket.
///
/// - `changed = known_current ∩ gathered`
/// - `new = gathered − known_current`
/// - `deleted = known_current − gathered`
pub fn reconcile(known_current: &BTreeSet<String>, gathered: &BTreeSet<String>) -> Reconciliation {
    Reconciliation {
        new: gathered.difference(known_current).cloned().collect(),
        changed: gathered.intersection(known_current).cloned().collect(),
        deleted: known_current.difference(gathered).cloned().collect(),
    }
}
