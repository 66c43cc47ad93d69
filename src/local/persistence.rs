use std::collections::HashMap;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::SyncResult;
use crate::local::mutation_queue::MutationQueue;
use crate::local::query_cache::QueryCache;
use crate::local::remote_document_cache::RemoteDocumentCache;

/// The identity that owns a mutation queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }
}

/// In-memory implementation of the transactional store boundary.
///
/// The remote document cache and query cache are user-independent (server
/// state is the same for everyone); mutation queues are per user but draw
/// batch ids from one shared counter, keeping ids globally unique.
///
/// Transactions serialize behind a single cooperative lock: no two run
/// concurrently, and a queued transaction starts only after the previous one
/// fully settles.
pub struct MemoryPersistence {
    transaction_lock: async_lock::Mutex<()>,
    remote_documents: Arc<RemoteDocumentCache>,
    query_cache: Arc<QueryCache>,
    mutation_queues: Mutex<HashMap<User, Arc<MutationQueue>>>,
    next_batch_id: Arc<AtomicI32>,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            transaction_lock: async_lock::Mutex::new(()),
            remote_documents: Arc::new(RemoteDocumentCache::new()),
            query_cache: Arc::new(QueryCache::new()),
            mutation_queues: Mutex::new(HashMap::new()),
            next_batch_id: Arc::new(AtomicI32::new(1)),
        }
    }

    /// Runs `op` exclusively. Everything it reads and writes observes one
    /// consistent snapshot of the store.
    pub async fn run_transaction<T>(
        &self,
        label: &str,
        op: impl FnOnce() -> SyncResult<T>,
    ) -> SyncResult<T> {
        let _guard = self.transaction_lock.lock().await;
        debug!("Starting transaction: {label}");
        op()
    }

    pub fn remote_document_cache(&self) -> Arc<RemoteDocumentCache> {
        self.remote_documents.clone()
    }

    pub fn query_cache(&self) -> Arc<QueryCache> {
        self.query_cache.clone()
    }

    /// The mutation queue for `user`, created on first use.
    pub fn mutation_queue(&self, user: &User) -> Arc<MutationQueue> {
        self.mutation_queues
            .lock()
            .expect("poisoned")
            .entry(user.clone())
            .or_insert_with(|| Arc::new(MutationQueue::new(self.next_batch_id.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mutation, Timestamp};
    use crate::value::ObjectValue;
    use serde_json::json;

    #[test]
    fn queues_are_per_user_but_share_batch_ids() {
        let persistence = MemoryPersistence::new();
        let anonymous = persistence.mutation_queue(&User::unauthenticated());
        let alice = persistence.mutation_queue(&User::authenticated("alice"));
        assert!(!Arc::ptr_eq(&anonymous, &alice));

        let mutation = || {
            Mutation::set(
                crate::model::DocumentKey::from_string("rooms/a").unwrap(),
                ObjectValue::from_json(&json!({ "v": 1 })),
            )
        };
        let a = anonymous
            .add_mutation_batch(Timestamp::new(1, 0), vec![mutation()])
            .unwrap();
        let b = alice
            .add_mutation_batch(Timestamp::new(1, 0), vec![mutation()])
            .unwrap();
        assert!(b.batch_id > a.batch_id);

        // Same user gets the same queue back.
        let again = persistence.mutation_queue(&User::unauthenticated());
        assert!(Arc::ptr_eq(&anonymous, &again));
    }

    #[tokio::test]
    async fn transactions_propagate_results_and_errors() {
        let persistence = MemoryPersistence::new();
        let value = persistence
            .run_transaction("Read value", || Ok(7))
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = persistence
            .run_transaction("Fail", || -> SyncResult<()> {
                Err(crate::error::internal_error("boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "sync/internal");
    }
}
