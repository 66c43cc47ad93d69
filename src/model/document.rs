use crate::model::{DocumentKey, SnapshotVersion};
use crate::value::{FieldPath, FieldValue, ObjectValue};

/// A document that exists, together with its data and version.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub key: DocumentKey,
    pub version: SnapshotVersion,
    pub data: ObjectValue,
    /// True while at least one pending local mutation shaped this view of
    /// the document.
    pub has_local_mutations: bool,
}

impl Document {
    pub fn new(
        key: DocumentKey,
        version: SnapshotVersion,
        data: ObjectValue,
        has_local_mutations: bool,
    ) -> Self {
        Self {
            key,
            version,
            data,
            has_local_mutations,
        }
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        self.data.field(path)
    }
}

/// A document known not to exist at `version`.
///
/// `version` may be `SnapshotVersion::MIN` when the absence is not
/// time-stamped (e.g. a locally deleted document the server has not
/// confirmed yet).
#[derive(Clone, Debug, PartialEq)]
pub struct NoDocument {
    pub key: DocumentKey,
    pub version: SnapshotVersion,
}

impl NoDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self { key, version }
    }
}

/// Either a document or a tombstone for one.
#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => &doc.key,
            MaybeDocument::NoDocument(no_doc) => &no_doc.key,
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version,
            MaybeDocument::NoDocument(no_doc) => no_doc.version,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            MaybeDocument::NoDocument(_) => None,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            MaybeDocument::NoDocument(_) => None,
        }
    }

    pub fn has_local_mutations(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_local_mutations,
            MaybeDocument::NoDocument(_) => false,
        }
    }
}
