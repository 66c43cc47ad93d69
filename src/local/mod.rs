mod garbage_collector;
mod local_documents_view;
mod local_store;
mod mutation_queue;
mod persistence;
mod query_cache;
mod reference_set;
mod remote_document_cache;

pub use garbage_collector::{
    EagerGarbageCollector, GarbageCollector, GarbageSource, NoOpGarbageCollector,
};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult};
pub use mutation_queue::MutationQueue;
pub use persistence::{MemoryPersistence, User};
pub use query_cache::{QueryCache, QueryData, QueryPurpose};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::RemoteDocumentCache;
