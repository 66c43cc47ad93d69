use std::collections::BTreeMap;

use crate::core::Query;
use crate::error::{internal_error, SyncResult};
use crate::model::{Document, DocumentKey, DocumentSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Data unchanged, but `has_local_mutations` or target membership
    /// changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    /// For removals this is the document as it last appeared in the view.
    pub doc: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, doc: Document) -> Self {
        Self { change_type, doc }
    }
}

/// Accumulates changes per key while a view fold runs, merging repeated
/// changes to the same key deterministically.
///
/// All sixteen `(old, new)` combinations are enumerated below. Ten are legal;
/// the remaining six cannot be produced by a correct fold and are reported as
/// invariant violations rather than silently merged.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) -> SyncResult<()> {
        use ChangeType::{Added, Metadata, Modified, Removed};

        let key = change.doc.key.clone();
        let old = match self.changes.get(&key) {
            None => {
                self.changes.insert(key, change);
                return Ok(());
            }
            Some(existing) => existing.change_type,
        };

        let merged = match (old, change.change_type) {
            // A document added then amended within the same fold is still an
            // addition from the view's perspective.
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.doc)),
            (Added, Metadata) => Some(DocumentViewChange::new(Added, change.doc)),
            // Added then removed cancels out entirely.
            (Added, Removed) => None,
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Modified, Metadata) => Some(DocumentViewChange::new(Modified, change.doc)),
            // Keep the old document for the removal event.
            (Modified, Removed) => {
                let prior = self.changes.get(&key).expect("checked above").doc.clone();
                Some(DocumentViewChange::new(Removed, prior))
            }
            // Removed then re-added reads as a modification.
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Metadata, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Metadata, Metadata) => Some(DocumentViewChange::new(Metadata, change.doc)),
            (Metadata, Removed) => Some(DocumentViewChange::new(Removed, change.doc)),
            // The six remaining combinations are unreachable in a correct
            // fold: a present document cannot be added again, and a removed
            // one cannot change without first being re-added.
            (Added, Added)
            | (Modified, Added)
            | (Metadata, Added)
            | (Removed, Modified)
            | (Removed, Metadata)
            | (Removed, Removed) => {
                return Err(internal_error(format!(
                    "Unsupported change combination for {key}: {old:?} then {:?}",
                    change.change_type
                )));
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    /// The merged changes in key order.
    pub fn get_changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// The view only reflects local state; the server may disagree.
    Local,
    /// The server confirmed the view is current and nothing is in limbo.
    Synced,
}

/// One consistent, ordered snapshot of a query's results.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    /// Ordered: removals first, then additions/modifications in query order.
    pub doc_changes: Vec<DocumentViewChange>,
    pub from_cache: bool,
    pub has_pending_writes: bool,
    pub sync_state_changed: bool,
}
