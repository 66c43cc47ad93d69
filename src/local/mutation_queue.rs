use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::debug;

use crate::core::Query;
use crate::error::{internal_error, SyncResult};
use crate::local::garbage_collector::{GarbageCollector, GarbageSource};
use crate::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCHID_UNKNOWN};

struct QueueState {
    /// Pending batches in batch-id order.
    queue: Vec<MutationBatch>,
    highest_acknowledged_batch_id: BatchId,
    last_stream_token: Bytes,
    /// (key, batch id) pairs for every mutation in the queue.
    batches_by_key: BTreeSet<(DocumentKey, BatchId)>,
}

/// Per-user ordered queue of pending mutation batches.
///
/// Batch ids come from a counter shared by all queues on the same store, so
/// an id never repeats even across user switches.
pub struct MutationQueue {
    shared_next_batch_id: Arc<AtomicI32>,
    state: Mutex<QueueState>,
    garbage_collector: Mutex<Option<Weak<dyn GarbageCollector>>>,
}

impl MutationQueue {
    pub fn new(shared_next_batch_id: Arc<AtomicI32>) -> Self {
        Self {
            shared_next_batch_id,
            state: Mutex::new(QueueState {
                queue: Vec::new(),
                highest_acknowledged_batch_id: BATCHID_UNKNOWN,
                last_stream_token: Bytes::new(),
                batches_by_key: BTreeSet::new(),
            }),
            garbage_collector: Mutex::new(None),
        }
    }

    pub fn set_garbage_collector(&self, collector: Option<Weak<dyn GarbageCollector>>) {
        *self.garbage_collector.lock().expect("poisoned") = collector;
    }

    /// Startup repair: an acknowledged-marker at or past the next batch id
    /// means every batch was acknowledged and removed, so the marker can be
    /// reset. Only done once the queue is verified empty.
    pub fn start(&self) {
        let mut state = self.state.lock().expect("poisoned");
        if state.queue.is_empty()
            && state.highest_acknowledged_batch_id >= self.shared_next_batch_id.load(Ordering::SeqCst)
        {
            debug!("MutationQueue: resetting acknowledged marker on empty queue");
            state.highest_acknowledged_batch_id = BATCHID_UNKNOWN;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("poisoned").queue.is_empty()
    }

    pub fn add_mutation_batch(
        &self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> SyncResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(internal_error("Mutation batches must not be empty"));
        }

        let batch_id = self.shared_next_batch_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("poisoned");
        if let Some(last) = state.queue.last() {
            if last.batch_id >= batch_id {
                return Err(internal_error("Mutation batch ids must be monotonically increasing"));
            }
        }

        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        for key in batch.keys() {
            state.batches_by_key.insert((key, batch_id));
        }
        state.queue.push(batch.clone());
        Ok(batch)
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        let state = self.state.lock().expect("poisoned");
        state
            .queue
            .binary_search_by_key(&batch_id, |batch| batch.batch_id)
            .ok()
            .map(|index| state.queue[index].clone())
    }

    /// The first pending batch with an id greater than `batch_id`, i.e. the
    /// next batch the write stream should send.
    pub fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        let state = self.state.lock().expect("poisoned");
        state
            .queue
            .iter()
            .find(|batch| batch.batch_id > batch_id)
            .cloned()
    }

    pub fn get_all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.state.lock().expect("poisoned").queue.clone()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let state = self.state.lock().expect("poisoned");
        let range = (key.clone(), BatchId::MIN)..=(key.clone(), BatchId::MAX);
        state
            .batches_by_key
            .range(range)
            .filter_map(|(_, batch_id)| {
                state
                    .queue
                    .binary_search_by_key(batch_id, |batch| batch.batch_id)
                    .ok()
                    .map(|index| state.queue[index].clone())
            })
            .collect()
    }

    /// Batches containing a mutation on any immediate child of the query's
    /// collection path. A collection-scoped scan, not a per-document lookup.
    pub fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let state = self.state.lock().expect("poisoned");
        let mut batch_ids = BTreeSet::new();
        for (key, batch_id) in &state.batches_by_key {
            if query.path().is_immediate_parent_of(key.path()) {
                batch_ids.insert(*batch_id);
            }
        }
        batch_ids
            .into_iter()
            .filter_map(|batch_id| {
                state
                    .queue
                    .binary_search_by_key(&batch_id, |batch| batch.batch_id)
                    .ok()
                    .map(|index| state.queue[index].clone())
            })
            .collect()
    }

    /// Records the server's acknowledgment. Batches acknowledge strictly in
    /// queue order; anything else is an invariant violation.
    pub fn acknowledge_batch(&self, batch: &MutationBatch, stream_token: Bytes) -> SyncResult<()> {
        let mut state = self.state.lock().expect("poisoned");
        if batch.batch_id <= state.highest_acknowledged_batch_id {
            return Err(internal_error(format!(
                "Batch {} acknowledged out of order (highest so far: {})",
                batch.batch_id, state.highest_acknowledged_batch_id
            )));
        }
        // Already-acknowledged batches may still sit at the front of the
        // queue while their results are held, so the order check is against
        // the first unacknowledged batch.
        let highest_acknowledged = state.highest_acknowledged_batch_id;
        match state
            .queue
            .iter()
            .find(|queued| queued.batch_id > highest_acknowledged)
        {
            Some(first_pending) if first_pending.batch_id == batch.batch_id => {}
            _ => {
                return Err(internal_error(
                    "Can only acknowledge the first pending batch in the mutation queue",
                ));
            }
        }

        state.highest_acknowledged_batch_id = batch.batch_id;
        state.last_stream_token = stream_token;
        Ok(())
    }

    #[cfg(test)]
    fn set_highest_acknowledged_batch_id_for_test(&self, batch_id: BatchId) {
        self.state.lock().expect("poisoned").highest_acknowledged_batch_id = batch_id;
    }

    pub fn get_highest_acknowledged_batch_id(&self) -> BatchId {
        self.state
            .lock()
            .expect("poisoned")
            .highest_acknowledged_batch_id
    }

    pub fn get_last_stream_token(&self) -> Bytes {
        self.state.lock().expect("poisoned").last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, stream_token: Bytes) {
        self.state.lock().expect("poisoned").last_stream_token = stream_token;
    }

    /// Removes acknowledged or rejected batches. The batches must form a
    /// contiguous run at their position in the queue. Every touched key is
    /// reported exactly once as potential garbage.
    pub fn remove_mutation_batches(&self, batches: &[MutationBatch]) -> SyncResult<()> {
        let Some(first) = batches.first() else {
            return Ok(());
        };

        let affected_keys = {
            let mut state = self.state.lock().expect("poisoned");
            let start = state
                .queue
                .binary_search_by_key(&first.batch_id, |batch| batch.batch_id)
                .map_err(|_| internal_error("Can only remove batches that are in the queue"))?;
            for (offset, batch) in batches.iter().enumerate() {
                match state.queue.get(start + offset) {
                    Some(queued) if queued.batch_id == batch.batch_id => {}
                    _ => {
                        return Err(internal_error(
                            "Removed batches must be contiguous in the queue",
                        ));
                    }
                }
            }

            state.queue.drain(start..start + batches.len());
            let mut affected_keys = BTreeSet::new();
            for batch in batches {
                for key in batch.keys() {
                    state.batches_by_key.remove(&(key.clone(), batch.batch_id));
                    affected_keys.insert(key);
                }
            }
            affected_keys
        };

        let collector = self.garbage_collector.lock().expect("poisoned");
        if let Some(collector) = collector.as_ref().and_then(Weak::upgrade) {
            for key in &affected_keys {
                collector.add_potential_garbage_key(key);
            }
        }
        Ok(())
    }
}

impl GarbageSource for MutationQueue {
    fn contains_key(&self, key: &DocumentKey) -> bool {
        let state = self.state.lock().expect("poisoned");
        let range = (key.clone(), BatchId::MIN)..=(key.clone(), BatchId::MAX);
        state.batches_by_key.range(range).next().is_some()
    }
}
