use std::collections::BTreeMap;

use crate::model::{Document, DocumentKey};

/// An ordered set of documents, keyed and ordered by `DocumentKey`.
///
/// Views use this as their materialized result set; iteration order is the
/// query order (key order for collection queries).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentSet {
    docs: BTreeMap<DocumentKey, Document>,
}

impl DocumentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.docs.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.docs.get(key)
    }

    /// The last document in query order; the eviction candidate for limit
    /// queries.
    pub fn last(&self) -> Option<&Document> {
        self.docs.values().next_back()
    }

    pub fn add(&mut self, doc: Document) {
        self.docs.insert(doc.key.clone(), doc);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        self.docs.remove(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.docs.keys()
    }
}

impl IntoIterator for DocumentSet {
    type Item = Document;
    type IntoIter = std::collections::btree_map::IntoValues<DocumentKey, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.docs.into_values()
    }
}
