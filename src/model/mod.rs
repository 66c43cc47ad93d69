mod document;
mod document_key;
mod document_set;
mod mutation;
mod mutation_batch;
mod resource_path;
mod timestamp;

pub use document::{Document, MaybeDocument, NoDocument};
pub use document_key::DocumentKey;
pub use document_set::DocumentSet;
pub use mutation::{FieldTransform, Mutation, MutationResult, Precondition, TransformOperation};
pub use mutation_batch::{MutationBatch, MutationBatchResult, BATCHID_UNKNOWN};
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};

/// Identifier the server uses for a listened query.
pub type TargetId = i32;

/// Identifier of a mutation batch; strictly increasing, globally unique per
/// underlying store.
pub type BatchId = i32;
