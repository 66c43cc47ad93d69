use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::model::{DocumentKey, MaybeDocument, SnapshotVersion, TargetId};

/// How a target's confirmed document membership changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetMapping {
    /// Full replacement: the set is the complete new membership.
    Reset(BTreeSet<DocumentKey>),
    /// Incremental: keys entering and leaving the target.
    Update {
        added: BTreeSet<DocumentKey>,
        removed: BTreeSet<DocumentKey>,
    },
}

impl TargetMapping {
    pub fn empty_update() -> Self {
        TargetMapping::Update {
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn add(&mut self, key: DocumentKey) {
        match self {
            TargetMapping::Reset(documents) => {
                documents.insert(key);
            }
            TargetMapping::Update { added, removed } => {
                removed.remove(&key);
                added.insert(key);
            }
        }
    }

    pub fn remove(&mut self, key: DocumentKey) {
        match self {
            TargetMapping::Reset(documents) => {
                documents.remove(&key);
            }
            TargetMapping::Update { added, removed } => {
                added.remove(&key);
                removed.insert(key);
            }
        }
    }
}

/// Whether a remote event changes the target's "consistent with the server"
/// flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurrentStatusUpdate {
    None,
    MarkCurrent,
    MarkNotCurrent,
}

/// Everything one remote event says about a single target.
#[derive(Clone, Debug)]
pub struct TargetChange {
    /// None when only the target's status or resume token changed.
    pub mapping: Option<TargetMapping>,
    pub current_status: CurrentStatusUpdate,
    /// Empty when the server did not issue a fresh token.
    pub resume_token: Bytes,
    pub snapshot_version: SnapshotVersion,
}

/// One consistent batch of server changes: per-target membership/state
/// updates plus the document contents they imply, all at `snapshot_version`.
#[derive(Clone, Debug)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    pub document_updates: BTreeMap<DocumentKey, MaybeDocument>,
}

impl RemoteEvent {
    pub fn add_document_update(&mut self, doc: MaybeDocument) {
        self.document_updates.insert(doc.key().clone(), doc);
    }
}
