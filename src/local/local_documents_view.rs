use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::Query;
use crate::error::SyncResult;
use crate::local::mutation_queue::MutationQueue;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{DocumentKey, DocumentSet, MaybeDocument, NoDocument, SnapshotVersion};

/// The read side of the store: server-confirmed documents with every pending
/// mutation overlaid, so callers always see their own writes.
pub struct LocalDocumentsView {
    remote_documents: Arc<RemoteDocumentCache>,
    mutation_queue: Arc<MutationQueue>,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: Arc<RemoteDocumentCache>,
        mutation_queue: Arc<MutationQueue>,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
        }
    }

    /// The local view of one document. Absence with no pending mutation is
    /// an un-versioned tombstone, never an error.
    pub fn get_document(&self, key: &DocumentKey) -> MaybeDocument {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_key(key);
        let mut doc = self.remote_documents.get_entry(key);
        for batch in &batches {
            doc = batch.apply_to_local_view(key, doc);
        }
        doc.unwrap_or_else(|| {
            MaybeDocument::NoDocument(NoDocument::new(key.clone(), SnapshotVersion::MIN))
        })
    }

    pub fn get_documents(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MaybeDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_document(key)))
            .collect()
    }

    pub fn get_documents_matching_query(&self, query: &Query) -> SyncResult<DocumentSet> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let mut results = DocumentSet::new();
            if let MaybeDocument::Document(doc) = self.get_document(&key) {
                results.add(doc);
            }
            return Ok(results);
        }
        self.get_documents_matching_collection_query(query)
    }

    fn get_documents_matching_collection_query(&self, query: &Query) -> SyncResult<DocumentSet> {
        let mut results: BTreeMap<DocumentKey, MaybeDocument> = self
            .remote_documents
            .get_documents_matching_query(query)
            .into_iter()
            .map(|(key, doc)| (key, MaybeDocument::Document(doc)))
            .collect();

        let batches = self.mutation_queue.get_all_mutation_batches_affecting_query(query);

        // A pending write can create a document the remote cache has never
        // seen; pull in cached bases for every key the batches touch before
        // overlaying.
        for batch in &batches {
            for key in batch.keys() {
                if !query.path().is_immediate_parent_of(key.path()) {
                    continue;
                }
                if !results.contains_key(&key) {
                    if let Some(remote_doc) = self.remote_documents.get_entry(&key) {
                        results.insert(key, remote_doc);
                    }
                }
            }
        }

        for batch in &batches {
            for key in batch.keys() {
                if !query.path().is_immediate_parent_of(key.path()) {
                    continue;
                }
                let base = results.remove(&key);
                if let Some(mutated) = batch.apply_to_local_view(&key, base) {
                    results.insert(key, mutated);
                }
            }
        }

        // Mutation overlays can push documents out of the result set; the
        // query predicate is re-checked on the final view.
        let mut documents = DocumentSet::new();
        for maybe_doc in results.into_values() {
            if let MaybeDocument::Document(doc) = maybe_doc {
                if query.matches(&doc) {
                    documents.add(doc);
                }
            }
        }

        if let Some(limit) = query.limit() {
            while documents.len() > limit {
                let last_key = documents
                    .last()
                    .map(|doc| doc.key.clone())
                    .expect("non-empty set has a last doc");
                documents.delete(&last_key);
            }
        }
        Ok(documents)
    }
}
