use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::core::{ChangeType, Query, TargetIdGenerator, ViewSnapshot};
use crate::error::{internal_error, SyncResult};
use crate::local::garbage_collector::{GarbageCollector, GarbageSource};
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::mutation_queue::MutationQueue;
use crate::local::persistence::{MemoryPersistence, User};
use crate::local::query_cache::{QueryCache, QueryData, QueryPurpose};
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{
    BatchId, DocumentKey, DocumentSet, MaybeDocument, Mutation, MutationBatchResult, TargetId,
    Timestamp,
};
use crate::remote::{RemoteEvent, TargetMapping};

/// What a local write produced: the batch's id and the resulting local view
/// of every document it touched.
#[derive(Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, MaybeDocument>,
}

/// Keys a view started or stopped pinning, extracted from one snapshot.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub query: Query,
    pub added: BTreeSet<DocumentKey>,
    pub removed: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(snapshot: &ViewSnapshot) -> Self {
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    added.insert(change.doc.key.clone());
                }
                ChangeType::Removed => {
                    removed.insert(change.doc.key.clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            query: snapshot.query.clone(),
            added,
            removed,
        }
    }
}

struct StoreState {
    /// QueryData for every currently allocated target.
    target_ids: BTreeMap<TargetId, QueryData>,
    /// Acknowledged batch results waiting for the watch stream to catch up
    /// to their commit version. Released strictly in order, head first.
    held_batch_results: VecDeque<MutationBatchResult>,
    target_id_generator: TargetIdGenerator,
}

/// The orchestrator: every public entry point runs as one named transaction
/// against the persistence layer and leaves all caches mutually consistent.
pub struct LocalStore {
    persistence: Arc<MemoryPersistence>,
    user: User,
    mutation_queue: Arc<MutationQueue>,
    remote_documents: Arc<RemoteDocumentCache>,
    query_cache: Arc<QueryCache>,
    local_documents: LocalDocumentsView,
    garbage_collector: Arc<dyn GarbageCollector>,
    /// Documents pinned by an active view; one of the three garbage sources.
    local_view_references: Arc<ReferenceSet>,
    state: Mutex<StoreState>,
}

impl LocalStore {
    pub fn new(
        persistence: Arc<MemoryPersistence>,
        user: User,
        garbage_collector: Arc<dyn GarbageCollector>,
    ) -> Self {
        let mutation_queue = persistence.mutation_queue(&user);
        let remote_documents = persistence.remote_document_cache();
        let query_cache = persistence.query_cache();
        let local_documents =
            LocalDocumentsView::new(remote_documents.clone(), mutation_queue.clone());
        let local_view_references = Arc::new(ReferenceSet::new());

        let collector_ref = Arc::downgrade(&garbage_collector);
        mutation_queue.set_garbage_collector(Some(collector_ref.clone()));
        query_cache.set_garbage_collector(Some(collector_ref.clone()));
        local_view_references.set_garbage_collector(Some(collector_ref));

        let queue_source: Arc<dyn GarbageSource> = mutation_queue.clone();
        garbage_collector.add_garbage_source(Arc::downgrade(&queue_source));
        let cache_source: Arc<dyn GarbageSource> = query_cache.clone();
        garbage_collector.add_garbage_source(Arc::downgrade(&cache_source));
        let view_source: Arc<dyn GarbageSource> = local_view_references.clone();
        garbage_collector.add_garbage_source(Arc::downgrade(&view_source));

        let target_id_generator = TargetIdGenerator::new(query_cache.get_highest_target_id());

        Self {
            persistence,
            user,
            mutation_queue,
            remote_documents,
            query_cache,
            local_documents,
            garbage_collector,
            local_view_references,
            state: Mutex::new(StoreState {
                target_ids: BTreeMap::new(),
                held_batch_results: VecDeque::new(),
                target_id_generator,
            }),
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Runs the mutation queue's startup repair.
    pub async fn start(&self) -> SyncResult<()> {
        self.persistence
            .run_transaction("Start LocalStore", || {
                self.mutation_queue.start();
                Ok(())
            })
            .await
    }

    /// Appends a batch of mutations and returns the latency-compensated
    /// local view of every document the batch touches.
    pub async fn local_write(&self, mutations: Vec<Mutation>) -> SyncResult<LocalWriteResult> {
        self.persistence
            .run_transaction("Locally write mutations", || {
                let batch = self
                    .mutation_queue
                    .add_mutation_batch(Timestamp::now(), mutations)?;
                let keys = batch.keys();
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: self.local_documents.get_documents(&keys),
                })
            })
            .await
    }

    /// Records the server's acknowledgment of a batch. If the watch stream
    /// has not caught up to the batch's commit version, the result is held
    /// so the local view keeps showing the write as pending; otherwise it is
    /// applied to the remote document cache and the batch removed.
    pub async fn acknowledge_batch(
        &self,
        batch_result: MutationBatchResult,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>> {
        self.persistence
            .run_transaction("Acknowledge batch", || {
                self.mutation_queue
                    .acknowledge_batch(&batch_result.batch, batch_result.stream_token.clone())?;
                let affected = batch_result.batch.keys();

                let mut state = self.state.lock().expect("poisoned");
                if self.should_hold_batch_result(&state, &batch_result) {
                    if let Some(back) = state.held_batch_results.back() {
                        if back.commit_version > batch_result.commit_version {
                            // The release check only ever looks at the head,
                            // so an out-of-order commit version would stall
                            // everything behind it.
                            warn!(
                                "LocalStore: held batch {} has a commit version below its predecessor",
                                batch_result.batch_id()
                            );
                        }
                    }
                    debug!("LocalStore: holding batch result {}", batch_result.batch_id());
                    state.held_batch_results.push_back(batch_result);
                } else {
                    drop(state);
                    self.release_batch_results(std::slice::from_ref(&batch_result))?;
                }

                Ok(self.local_documents.get_documents(&affected))
            })
            .await
    }

    /// Removes a batch the server rejected. Only the oldest pending batch
    /// can legally be rejected; the write stream guarantees that order.
    pub async fn reject_batch(
        &self,
        batch_id: BatchId,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>> {
        self.persistence
            .run_transaction("Reject batch", || {
                let batch = self
                    .mutation_queue
                    .lookup_mutation_batch(batch_id)
                    .ok_or_else(|| internal_error("Attempt to reject nonexistent batch"))?;

                let highest_ack = self.mutation_queue.get_highest_acknowledged_batch_id();
                if batch_id <= highest_ack {
                    return Err(internal_error("Acknowledged batches cannot be rejected"));
                }
                match self
                    .mutation_queue
                    .get_next_mutation_batch_after_batch_id(highest_ack)
                {
                    Some(oldest) if oldest.batch_id == batch_id => {}
                    _ => {
                        return Err(internal_error(
                            "Can only reject the oldest unacknowledged batch",
                        ));
                    }
                }

                let affected = batch.keys();
                self.mutation_queue.remove_mutation_batches(&[batch])?;
                Ok(self.local_documents.get_documents(&affected))
            })
            .await
    }

    /// Folds one remote event into the caches: target membership, resume
    /// tokens, document contents, the remote snapshot high-water mark, and
    /// any held batch results the new version unblocks.
    pub async fn apply_remote_event(
        &self,
        event: RemoteEvent,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>> {
        self.persistence
            .run_transaction("Apply remote event", || {
                let mut state = self.state.lock().expect("poisoned");

                for (target_id, change) in &event.target_changes {
                    // Events can race a release; changes for unallocated
                    // targets are dropped.
                    let Some(query_data) = state.target_ids.get(target_id).cloned() else {
                        continue;
                    };

                    match &change.mapping {
                        Some(TargetMapping::Reset(documents)) => {
                            self.query_cache.remove_matching_keys_for_target_id(*target_id);
                            self.query_cache.add_matching_keys(documents, *target_id);
                        }
                        Some(TargetMapping::Update { added, removed }) => {
                            self.query_cache.remove_matching_keys(removed, *target_id);
                            self.query_cache.add_matching_keys(added, *target_id);
                        }
                        None => {}
                    }

                    if !change.resume_token.is_empty() {
                        let updated =
                            query_data.update(change.snapshot_version, change.resume_token.clone());
                        self.query_cache.add_query_data(updated.clone());
                        state.target_ids.insert(*target_id, updated);
                    }
                }

                let mut changed_keys = BTreeSet::new();
                for (key, doc) in &event.document_updates {
                    changed_keys.insert(key.clone());
                    let existing = self.remote_documents.get_entry(key);
                    // Stale watch updates are dropped; the MIN version is
                    // the limbo-resolution "confirmed absent" sentinel and
                    // always wins.
                    let apply = match &existing {
                        None => true,
                        Some(existing) => {
                            doc.version().is_min() || doc.version() >= existing.version()
                        }
                    };
                    if apply {
                        self.remote_documents.add_entry(doc.clone());
                    } else {
                        debug!(
                            "LocalStore: ignoring outdated watch update for {key} ({} < {})",
                            doc.version(),
                            existing.as_ref().map(MaybeDocument::version).unwrap_or(doc.version()),
                        );
                    }
                }

                if !event.snapshot_version.is_min() {
                    self.query_cache
                        .set_last_remote_snapshot_version(event.snapshot_version);
                }

                let released = self.release_held_batch_results(&mut state)?;
                drop(state);
                changed_keys.extend(released);

                Ok(self.local_documents.get_documents(&changed_keys))
            })
            .await
    }

    /// Pins and unpins view-referenced documents.
    pub async fn notify_local_view_changes(
        &self,
        view_changes: Vec<LocalViewChanges>,
    ) -> SyncResult<()> {
        self.persistence
            .run_transaction("Notify local view changes", || {
                for change in &view_changes {
                    let Some(query_data) = self.query_cache.get_query_data(&change.query) else {
                        continue;
                    };
                    self.local_view_references
                        .add_references(&change.added, query_data.target_id);
                    self.local_view_references
                        .remove_references(&change.removed, query_data.target_id);
                }
                Ok(())
            })
            .await
    }

    /// Assigns (or revives) the target id for `query`. Allocating a query
    /// twice without releasing it is an invariant violation.
    pub async fn allocate_query(&self, query: Query) -> SyncResult<QueryData> {
        self.persistence
            .run_transaction("Allocate query", || {
                let mut state = self.state.lock().expect("poisoned");
                let query_data = match self.query_cache.get_query_data(&query) {
                    Some(cached) => cached,
                    None => {
                        let target_id = state.target_id_generator.next();
                        let query_data =
                            QueryData::new(query.clone(), target_id, QueryPurpose::Listen);
                        self.query_cache.add_query_data(query_data.clone());
                        query_data
                    }
                };
                if state.target_ids.contains_key(&query_data.target_id) {
                    return Err(internal_error("Tried to allocate an already allocated query"));
                }
                state.target_ids.insert(query_data.target_id, query_data.clone());
                Ok(query_data)
            })
            .await
    }

    /// Releases the target. When this was the last allocated target, held
    /// batch results are flushed: no watch data will arrive to unblock them.
    pub async fn release_query(&self, query: &Query) -> SyncResult<()> {
        self.persistence
            .run_transaction("Release query", || {
                let query_data = self
                    .query_cache
                    .get_query_data(query)
                    .ok_or_else(|| internal_error("Tried to release a nonexistent query"))?;

                let mut state = self.state.lock().expect("poisoned");
                state.target_ids.remove(&query_data.target_id);
                self.local_view_references
                    .remove_references_for_id(query_data.target_id);

                if self.garbage_collector.is_eager() {
                    self.query_cache.remove_query_data(&query_data);
                }

                if state.target_ids.is_empty() {
                    let held: Vec<MutationBatchResult> =
                        state.held_batch_results.drain(..).collect();
                    drop(state);
                    self.release_batch_results(&held)?;
                }
                Ok(())
            })
            .await
    }

    /// Cache-only read of the current local result set for `query`.
    pub async fn execute_query(&self, query: &Query) -> SyncResult<DocumentSet> {
        self.persistence
            .run_transaction("Execute query", || {
                self.local_documents.get_documents_matching_query(query)
            })
            .await
    }

    /// The server-confirmed membership of an allocated target, for
    /// existence-filter comparison and view seeding.
    pub async fn remote_document_keys(&self, target_id: TargetId) -> SyncResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Remote document keys", || {
                Ok(self.query_cache.get_matching_keys_for_target_id(target_id))
            })
            .await
    }

    /// Asks the collector for confirmed garbage and deletes it from the
    /// remote document cache, all in one transaction.
    pub async fn collect_garbage(&self) -> SyncResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Garbage collection", || {
                let garbage = self.garbage_collector.collect_garbage();
                for key in &garbage {
                    self.remote_documents.remove_entry(key);
                }
                Ok(garbage)
            })
            .await
    }

    /// Swaps in `new_user`'s mutation queue and reports every document whose
    /// local view may have changed (keys touched by either user's pending
    /// writes). Consumes the store: exactly one queue is ever live.
    ///
    /// Allocated targets do not carry over; the caller re-allocates its
    /// active queries against the returned store.
    pub async fn switch_user(
        self,
        new_user: User,
    ) -> SyncResult<(LocalStore, BTreeMap<DocumentKey, MaybeDocument>)> {
        let mut affected = BTreeSet::new();
        for batch in self.mutation_queue.get_all_mutation_batches() {
            affected.extend(batch.keys());
        }

        let new_store = LocalStore::new(self.persistence.clone(), new_user, self.garbage_collector.clone());
        new_store.start().await?;
        for batch in new_store.mutation_queue.get_all_mutation_batches() {
            affected.extend(batch.keys());
        }

        let changes = new_store
            .persistence
            .run_transaction("Switch user", || {
                Ok(new_store.local_documents.get_documents(&affected))
            })
            .await?;
        Ok((new_store, changes))
    }

    fn is_remote_up_to_version(&self, state: &StoreState, result: &MutationBatchResult) -> bool {
        // With no allocated targets the watch stream is idle and will never
        // advance past the commit version; holding would stall forever.
        self.query_cache.get_last_remote_snapshot_version() >= result.commit_version
            || state.target_ids.is_empty()
    }

    fn should_hold_batch_result(&self, state: &StoreState, result: &MutationBatchResult) -> bool {
        !state.held_batch_results.is_empty() || !self.is_remote_up_to_version(state, result)
    }

    /// Releases the longest releasable prefix of the held queue. Only the
    /// head is ever checked; a satisfiable result behind an unsatisfiable
    /// one stays held.
    fn release_held_batch_results(
        &self,
        state: &mut StoreState,
    ) -> SyncResult<BTreeSet<DocumentKey>> {
        let mut release_count = 0;
        for held in &state.held_batch_results {
            if !self.is_remote_up_to_version(state, held) {
                break;
            }
            release_count += 1;
        }
        if release_count == 0 {
            return Ok(BTreeSet::new());
        }
        let to_release: Vec<MutationBatchResult> =
            state.held_batch_results.drain(..release_count).collect();
        self.release_batch_results(&to_release)
    }

    /// Applies each result to the remote document cache and removes its
    /// batch from the queue. Results must be in batch-id order.
    fn release_batch_results(
        &self,
        results: &[MutationBatchResult],
    ) -> SyncResult<BTreeSet<DocumentKey>> {
        let mut affected = BTreeSet::new();
        let mut batches = Vec::with_capacity(results.len());
        for result in results {
            self.apply_write_to_remote_documents(result)?;
            affected.extend(result.batch.keys());
            batches.push(result.batch.clone());
        }
        if !batches.is_empty() {
            self.mutation_queue.remove_mutation_batches(&batches)?;
        }
        Ok(affected)
    }

    fn apply_write_to_remote_documents(&self, result: &MutationBatchResult) -> SyncResult<()> {
        for key in result.batch.keys() {
            let existing = self.remote_documents.get_entry(&key);
            if let Some(doc) = result.batch.apply_to_remote_document(&key, existing, result)? {
                self.remote_documents.add_entry(doc);
            }
        }
        Ok(())
    }
}
