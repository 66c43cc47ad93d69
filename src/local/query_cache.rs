use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, Weak};

use bytes::Bytes;
use log::warn;

use crate::core::Query;
use crate::local::garbage_collector::{GarbageCollector, GarbageSource};
use crate::local::reference_set::ReferenceSet;
use crate::model::{DocumentKey, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPurpose {
    /// A user-requested listen.
    Listen,
    /// Re-listen after the server's existence filter disagreed with the
    /// local count.
    ExistenceFilterMismatch,
    /// Point lookup resolving a limbo document.
    LimboResolution,
}

/// Everything the cache persists about one allocated target.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryData {
    pub query: Query,
    pub target_id: TargetId,
    pub purpose: QueryPurpose,
    pub snapshot_version: SnapshotVersion,
    pub resume_token: Bytes,
}

impl QueryData {
    pub fn new(query: Query, target_id: TargetId, purpose: QueryPurpose) -> Self {
        Self {
            query,
            target_id,
            purpose,
            snapshot_version: SnapshotVersion::MIN,
            resume_token: Bytes::new(),
        }
    }

    /// Copy with a refreshed version and resume token; everything else is
    /// immutable for the target's lifetime.
    pub fn update(&self, snapshot_version: SnapshotVersion, resume_token: Bytes) -> Self {
        Self {
            query: self.query.clone(),
            target_id: self.target_id,
            purpose: self.purpose,
            snapshot_version,
            resume_token,
        }
    }
}

struct CacheState {
    /// Buckets keyed by canonical id. Canonical ids may collide, so every
    /// lookup re-checks structural query equality.
    queries: HashMap<String, Vec<QueryData>>,
    highest_target_id: TargetId,
    last_remote_snapshot_version: SnapshotVersion,
}

/// Persisted state for allocated targets plus the target↔document
/// membership index.
pub struct QueryCache {
    state: Mutex<CacheState>,
    references: ReferenceSet,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                queries: HashMap::new(),
                highest_target_id: 0,
                last_remote_snapshot_version: SnapshotVersion::MIN,
            }),
            references: ReferenceSet::new(),
        }
    }

    pub fn set_garbage_collector(&self, collector: Option<Weak<dyn GarbageCollector>>) {
        self.references.set_garbage_collector(collector);
    }

    /// Adds or replaces the record for this query. The highest target id is
    /// updated in the same step, so allocation and the id high-water mark
    /// can never diverge.
    pub fn add_query_data(&self, query_data: QueryData) {
        let mut state = self.state.lock().expect("poisoned");
        state.highest_target_id = state.highest_target_id.max(query_data.target_id);
        let bucket = state
            .queries
            .entry(query_data.query.canonical_id())
            .or_default();
        match bucket
            .iter()
            .position(|existing| existing.query == query_data.query)
        {
            Some(index) => bucket[index] = query_data,
            None => bucket.push(query_data),
        }
    }

    /// Removes the record and every key membership held under its target id.
    pub fn remove_query_data(&self, query_data: &QueryData) {
        {
            let mut state = self.state.lock().expect("poisoned");
            let canonical_id = query_data.query.canonical_id();
            if let Some(bucket) = state.queries.get_mut(&canonical_id) {
                bucket.retain(|existing| existing.query != query_data.query);
                if bucket.is_empty() {
                    state.queries.remove(&canonical_id);
                }
            }
        }
        self.references.remove_references_for_id(query_data.target_id);
    }

    pub fn get_query_data(&self, query: &Query) -> Option<QueryData> {
        let state = self.state.lock().expect("poisoned");
        state
            .queries
            .get(&query.canonical_id())?
            .iter()
            .find(|candidate| &candidate.query == query)
            .cloned()
    }

    pub fn get_highest_target_id(&self) -> TargetId {
        self.state.lock().expect("poisoned").highest_target_id
    }

    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.state
            .lock()
            .expect("poisoned")
            .last_remote_snapshot_version
    }

    /// Monotonically non-decreasing; a regressing watch snapshot is dropped.
    pub fn set_last_remote_snapshot_version(&self, version: SnapshotVersion) {
        let mut state = self.state.lock().expect("poisoned");
        if version < state.last_remote_snapshot_version {
            warn!(
                "QueryCache: ignoring remote snapshot version regression {} -> {}",
                state.last_remote_snapshot_version, version
            );
            return;
        }
        state.last_remote_snapshot_version = version;
    }

    pub fn add_matching_keys(&self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.add_references(keys, target_id);
    }

    pub fn remove_matching_keys(&self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.remove_references(keys, target_id);
    }

    pub fn remove_matching_keys_for_target_id(&self, target_id: TargetId) {
        self.references.remove_references_for_id(target_id);
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.references_for_id(target_id)
    }
}

impl GarbageSource for QueryCache {
    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}
