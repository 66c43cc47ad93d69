use bytes::Bytes;

use crate::error::SyncError;
use crate::model::{DocumentKey, MaybeDocument, TargetId};

/// A document-level event from the watch stream: the document entered the
/// `updated_target_ids` targets and left the `removed_target_ids` targets,
/// optionally carrying its new contents (or tombstone).
#[derive(Clone, Debug)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// None when only target membership changed.
    pub new_doc: Option<MaybeDocument>,
}

/// Target lifecycle transitions reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A target-level event from the watch stream.
#[derive(Clone, Debug)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means "all targets currently being listened to".
    pub target_ids: Vec<TargetId>,
    pub resume_token: Bytes,
    /// Server-reported failure; only meaningful with `Removed`, and handled
    /// by the transport layer before the change reaches the aggregator.
    pub cause: Option<SyncError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Bytes::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes) -> Self {
        self.resume_token = resume_token;
        self
    }
}

/// The server's count of documents matching a target, used to detect missed
/// deletes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: usize,
}

/// Any single event the watch stream can deliver.
#[derive(Clone, Debug)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    Target(WatchTargetChange),
    Filter(ExistenceFilterChange),
}
