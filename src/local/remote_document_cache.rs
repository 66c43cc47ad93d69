use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::core::Query;
use crate::model::{Document, DocumentKey, MaybeDocument};

/// Server-confirmed documents (and tombstones), keyed by document key.
///
/// Version monotonicity is enforced by the local store when it applies
/// remote events; the cache itself stores whatever it is told.
#[derive(Default)]
pub struct RemoteDocumentCache {
    docs: Mutex<BTreeMap<DocumentKey, MaybeDocument>>,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, doc: MaybeDocument) {
        self.docs
            .lock()
            .expect("poisoned")
            .insert(doc.key().clone(), doc);
    }

    pub fn remove_entry(&self, key: &DocumentKey) {
        self.docs.lock().expect("poisoned").remove(key);
    }

    pub fn get_entry(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        self.docs.lock().expect("poisoned").get(key).cloned()
    }

    /// All cached documents matching `query`, in key order. Tombstones never
    /// match.
    pub fn get_documents_matching_query(&self, query: &Query) -> BTreeMap<DocumentKey, Document> {
        self.docs
            .lock()
            .expect("poisoned")
            .values()
            .filter_map(MaybeDocument::as_document)
            .filter(|doc| query.matches(doc))
            .map(|doc| (doc.key.clone(), doc.clone()))
            .collect()
    }
}
