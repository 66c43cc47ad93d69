use std::cmp::Ordering;

use crate::error::{invalid_argument, SyncResult};
use crate::model::{Document, DocumentKey, ResourcePath};

/// A query over a collection path, optionally bounded by a result limit.
///
/// Results order by document key. The richer builder surface (field filters,
/// order-by) lives outside the sync core; path plus limit is what the caches
/// and the diff engine operate on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Query {
    path: ResourcePath,
    limit: Option<usize>,
}

impl Query {
    pub fn new(path: ResourcePath) -> SyncResult<Self> {
        if path.is_empty() {
            return Err(invalid_argument("Queries must reference a non-root path"));
        }
        Ok(Self { path, limit: None })
    }

    pub fn at_path(path: &str) -> SyncResult<Self> {
        Self::new(ResourcePath::from_string(path)?)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// True when the query names a single document rather than a collection.
    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
    }

    /// A compact identity string. Not guaranteed unique: callers that bucket
    /// by canonical id must re-check structural equality.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        id
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.is_document_query() {
            doc.key.path() == &self.path
        } else {
            self.path.is_immediate_parent_of(doc.key.path())
        }
    }

    /// Result-set order for this query.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        DocumentKey::compare(&left.key, &right.key)
    }
}
