use std::collections::BTreeSet;
use std::sync::{Mutex, Weak};

use log::debug;

use crate::model::DocumentKey;

/// Anything that can pin a document: the mutation queue, the query cache's
/// membership index, or the local store's view references.
pub trait GarbageSource: Send + Sync {
    /// True while this source still references `key`.
    fn contains_key(&self, key: &DocumentKey) -> bool;
}

/// Decides which document keys are no longer referenced anywhere.
///
/// The collector only names garbage; deleting the cached documents is the
/// local store's job, inside the same transaction.
pub trait GarbageCollector: Send + Sync {
    /// Eager collectors want unreference notifications; sources may skip the
    /// bookkeeping entirely otherwise.
    fn is_eager(&self) -> bool;

    fn add_garbage_source(&self, source: Weak<dyn GarbageSource>);

    /// Marks `key` as possibly unreferenced; verified on the next collect.
    fn add_potential_garbage_key(&self, key: &DocumentKey);

    /// Confirms which candidates have no reference in any source and clears
    /// the candidate set.
    fn collect_garbage(&self) -> BTreeSet<DocumentKey>;
}

/// Reference-counting collector: every unreference makes a candidate, and a
/// scan over all sources confirms or clears it.
#[derive(Default)]
pub struct EagerGarbageCollector {
    sources: Mutex<Vec<Weak<dyn GarbageSource>>>,
    candidates: Mutex<BTreeSet<DocumentKey>>,
}

impl EagerGarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_referenced(sources: &[Weak<dyn GarbageSource>], key: &DocumentKey) -> bool {
        sources
            .iter()
            .filter_map(Weak::upgrade)
            .any(|source| source.contains_key(key))
    }
}

impl GarbageCollector for EagerGarbageCollector {
    fn is_eager(&self) -> bool {
        true
    }

    fn add_garbage_source(&self, source: Weak<dyn GarbageSource>) {
        self.sources.lock().expect("poisoned").push(source);
    }

    fn add_potential_garbage_key(&self, key: &DocumentKey) {
        self.candidates
            .lock()
            .expect("poisoned")
            .insert(key.clone());
    }

    fn collect_garbage(&self) -> BTreeSet<DocumentKey> {
        let candidates = std::mem::take(&mut *self.candidates.lock().expect("poisoned"));
        let mut sources = self.sources.lock().expect("poisoned");
        sources.retain(|source| source.strong_count() > 0);

        let garbage: BTreeSet<DocumentKey> = candidates
            .into_iter()
            .filter(|key| !Self::is_referenced(&sources, key))
            .collect();
        if !garbage.is_empty() {
            debug!("EagerGarbageCollector: {} documents confirmed garbage", garbage.len());
        }
        garbage
    }
}

/// Keeps everything. Used while other consumers of the store may still need
/// full history.
pub struct NoOpGarbageCollector;

impl GarbageCollector for NoOpGarbageCollector {
    fn is_eager(&self) -> bool {
        false
    }

    fn add_garbage_source(&self, _source: Weak<dyn GarbageSource>) {}

    fn add_potential_garbage_key(&self, _key: &DocumentKey) {}

    fn collect_garbage(&self) -> BTreeSet<DocumentKey> {
        BTreeSet::new()
    }
}
