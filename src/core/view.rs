use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use crate::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::core::Query;
use crate::error::{internal_error, SyncResult};
use crate::model::{DocumentKey, DocumentSet, MaybeDocument};
use crate::remote::{CurrentStatusUpdate, TargetChange, TargetMapping};

/// The result of folding a batch of document changes over a view, before the
/// view commits to it.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// True when a document crossed the limit boundary and the caller must
    /// re-query the local documents view for a replacement before applying.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboChange {
    Added,
    Removed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LimboDocumentChange {
    pub change: LimboChange,
    pub key: DocumentKey,
}

/// What applying a fold produced: at most one snapshot (no-op folds are
/// suppressed) plus limbo membership transitions.
#[derive(Debug)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Incremental diff engine for one query.
///
/// Holds the last committed result set and, given a batch of changed
/// documents, computes the minimal ordered change events plus limbo-document
/// transitions.
pub struct View {
    query: Query,
    /// Keys the server says currently match the target.
    synced_documents: BTreeSet<DocumentKey>,
    document_set: DocumentSet,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    current: bool,
    sync_state: Option<SyncState>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            query,
            synced_documents,
            document_set: DocumentSet::new(),
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            current: false,
            sync_state: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn sync_state(&self) -> Option<SyncState> {
        self.sync_state
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Folds `doc_changes` into a new result set without committing it.
    ///
    /// `previous_changes` carries the intermediate result of an earlier fold
    /// that required a refill; the refill query's documents are folded on top
    /// of it.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, MaybeDocument>,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> SyncResult<ViewDocumentChanges> {
        let had_previous = previous_changes.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous_changes {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        // With a full limit window, any document ranked past the current
        // last one can be ignored, and evicting from the window forces a
        // refill.
        let last_doc_in_limit = match self.query.limit() {
            Some(limit) if old_document_set.len() == limit => old_document_set.last().cloned(),
            _ => None,
        };

        for (key, new_maybe_doc) in doc_changes {
            let old_doc = old_document_set.get(key).cloned();
            let new_doc = new_maybe_doc
                .as_document()
                .filter(|doc| self.query.matches(doc))
                .cloned();

            if let Some(doc) = &new_doc {
                if doc.has_local_mutations {
                    new_mutated_keys.insert(key.clone());
                } else {
                    new_mutated_keys.remove(key);
                }
            }

            let mut change_applied = false;
            match (&old_doc, &new_doc) {
                (Some(old), Some(new)) => {
                    if old.data != new.data {
                        change_set
                            .track(DocumentViewChange::new(ChangeType::Modified, new.clone()))?;
                        change_applied = true;
                        if let Some(last) = &last_doc_in_limit {
                            if self.query.compare(new, last) == std::cmp::Ordering::Greater {
                                // The document moved past the limit boundary.
                                needs_refill = true;
                            }
                        }
                    } else if old.has_local_mutations != new.has_local_mutations {
                        change_set
                            .track(DocumentViewChange::new(ChangeType::Metadata, new.clone()))?;
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new.clone()))?;
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old.clone()))?;
                    change_applied = true;
                    if last_doc_in_limit.is_some() {
                        // A document vanished from a full window; a better
                        // match may exist outside the view.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(doc) => new_document_set.add(doc),
                    None => {
                        new_document_set.delete(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while new_document_set.len() > limit {
                let evicted = new_document_set
                    .last()
                    .cloned()
                    .expect("set larger than limit has a last doc");
                new_document_set.delete(&evicted.key);
                new_mutated_keys.remove(&evicted.key);
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted))?;
            }
        }

        if needs_refill && had_previous {
            return Err(internal_error(
                "View was refilled using docs that themselves needed refilling",
            ));
        }

        Ok(ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        })
    }

    /// Commits a fold, recomputes limbo membership and sync state, and emits
    /// a snapshot when anything user-visible changed.
    pub fn apply_changes(
        &mut self,
        changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
    ) -> SyncResult<ViewChange> {
        if changes.needs_refill {
            return Err(internal_error("Cannot apply changes that need a refill"));
        }

        let old_docs = mem::replace(&mut self.document_set, changes.document_set);
        self.mutated_keys = changes.mutated_keys;

        let mut doc_changes = changes.change_set.get_changes();
        doc_changes.sort_by(|a, b| {
            change_rank(a.change_type)
                .cmp(&change_rank(b.change_type))
                .then_with(|| self.query.compare(&a.doc, &b.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = self.update_limbo_documents();

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = Some(new_sync_state) != self.sync_state;
        self.sync_state = Some(new_sync_state);

        if doc_changes.is_empty() && !sync_state_changed {
            return Ok(ViewChange {
                snapshot: None,
                limbo_changes,
            });
        }

        Ok(ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.document_set.clone(),
                old_docs,
                doc_changes,
                from_cache: new_sync_state == SyncState::Local,
                has_pending_writes: !self.mutated_keys.is_empty(),
                sync_state_changed,
            }),
            limbo_changes,
        })
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };

        match &change.mapping {
            Some(TargetMapping::Reset(documents)) => {
                self.synced_documents = documents.clone();
            }
            Some(TargetMapping::Update { added, removed }) => {
                for key in removed {
                    self.synced_documents.remove(key);
                }
                self.synced_documents.extend(added.iter().cloned());
            }
            None => {}
        }

        match change.current_status {
            CurrentStatusUpdate::MarkCurrent => self.current = true,
            CurrentStatusUpdate::MarkNotCurrent => self.current = false,
            CurrentStatusUpdate::None => {}
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Limbo resolution only makes sense once the server claims the
        // target is current.
        if !self.current {
            return Vec::new();
        }

        let old_limbo = mem::take(&mut self.limbo_documents);
        let mut new_limbo = BTreeSet::new();
        for doc in self.document_set.iter() {
            if self.should_be_in_limbo(doc) {
                new_limbo.insert(doc.key.clone());
            }
        }
        self.limbo_documents = new_limbo;

        let mut changes = Vec::new();
        for key in &old_limbo {
            if !self.limbo_documents.contains(key) {
                changes.push(LimboDocumentChange {
                    change: LimboChange::Removed,
                    key: key.clone(),
                });
            }
        }
        for key in &self.limbo_documents {
            if !old_limbo.contains(key) {
                changes.push(LimboDocumentChange {
                    change: LimboChange::Added,
                    key: key.clone(),
                });
            }
        }
        changes
    }

    fn should_be_in_limbo(&self, doc: &crate::model::Document) -> bool {
        // In the result set, not confirmed by the server, and without a
        // local mutation that would explain the discrepancy.
        !self.synced_documents.contains(&doc.key) && !doc.has_local_mutations
    }
}

fn change_rank(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added | ChangeType::Modified | ChangeType::Metadata => 1,
    }
}
