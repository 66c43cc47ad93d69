use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::error::{internal_error, SyncResult};
use crate::model::{BatchId, DocumentKey, MaybeDocument, Mutation, MutationResult, SnapshotVersion, Timestamp};

/// Sentinel for "no batch".
pub const BATCHID_UNKNOWN: BatchId = -1;

/// An ordered list of mutations the user issued in one write call.
///
/// Batch ids are assigned from a single monotonic counter shared by every
/// queue on the same store, so they are globally unique, not per-user.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Every document key this batch touches.
    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Overlays this batch onto the local view of `key`.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let mut current = maybe_doc;
        for mutation in &self.mutations {
            if mutation.key() == key {
                current = mutation.apply_to_local_view(current, self.local_write_time);
            }
        }
        current
    }

    /// Applies the acknowledged batch to the server-confirmed view of `key`.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> SyncResult<Option<MaybeDocument>> {
        if batch_result.mutation_results.len() != self.mutations.len() {
            return Err(internal_error(format!(
                "Mismatch between mutations ({}) and results ({})",
                self.mutations.len(),
                batch_result.mutation_results.len()
            )));
        }

        let mut current = maybe_doc;
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == key {
                current = Some(mutation.apply_to_remote_document(current, result)?);
            }
        }
        Ok(current)
    }
}

/// An acknowledged batch together with the server's per-mutation results.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Bytes,
    /// Precomputed key → resulting version. Deleted documents adopt the
    /// batch's commit version (their mutation result carries none).
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from_batch(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> SyncResult<Self> {
        if mutation_results.len() != batch.mutations.len() {
            return Err(internal_error(format!(
                "Mutations sent ({}) must equal results received ({})",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let mut doc_versions = BTreeMap::new();
        for (mutation, result) in batch.mutations.iter().zip(&mutation_results) {
            let version = result.version.unwrap_or(commit_version);
            doc_versions.insert(mutation.key().clone(), version);
        }

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch.batch_id
    }
}
