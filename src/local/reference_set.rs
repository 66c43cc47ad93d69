use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, Weak};

use crate::local::garbage_collector::{GarbageCollector, GarbageSource};
use crate::model::DocumentKey;

#[derive(Default)]
struct Indexes {
    by_key: BTreeMap<DocumentKey, BTreeSet<i32>>,
    by_id: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

/// Bidirectional index between document keys and an owning id (a target id
/// or a batch id, depending on who holds the set).
///
/// Every removal is reported to the attached garbage collector as potential
/// garbage; the collector re-verifies against all sources before acting.
#[derive(Default)]
pub struct ReferenceSet {
    indexes: Mutex<Indexes>,
    garbage_collector: Mutex<Option<Weak<dyn GarbageCollector>>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_garbage_collector(&self, collector: Option<Weak<dyn GarbageCollector>>) {
        *self.garbage_collector.lock().expect("poisoned") = collector;
    }

    pub fn add_reference(&self, key: &DocumentKey, id: i32) {
        let mut indexes = self.indexes.lock().expect("poisoned");
        indexes.by_key.entry(key.clone()).or_default().insert(id);
        indexes.by_id.entry(id).or_default().insert(key.clone());
    }

    pub fn add_references(&self, keys: &BTreeSet<DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&self, key: &DocumentKey, id: i32) {
        {
            let mut indexes = self.indexes.lock().expect("poisoned");
            if let Some(ids) = indexes.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    indexes.by_key.remove(key);
                }
            }
            if let Some(keys) = indexes.by_id.get_mut(&id) {
                keys.remove(key);
                if keys.is_empty() {
                    indexes.by_id.remove(&id);
                }
            }
        }
        self.report_potential_garbage(key);
    }

    pub fn remove_references(&self, keys: &BTreeSet<DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held under `id`, returning the released keys.
    pub fn remove_references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = {
            let mut indexes = self.indexes.lock().expect("poisoned");
            let keys = indexes.by_id.remove(&id).unwrap_or_default();
            for key in &keys {
                if let Some(ids) = indexes.by_key.get_mut(key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        indexes.by_key.remove(key);
                    }
                }
            }
            keys
        };
        for key in &keys {
            self.report_potential_garbage(key);
        }
        keys
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.indexes
            .lock()
            .expect("poisoned")
            .by_id
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.lock().expect("poisoned").by_key.is_empty()
    }

    fn report_potential_garbage(&self, key: &DocumentKey) {
        let collector = self.garbage_collector.lock().expect("poisoned");
        if let Some(collector) = collector.as_ref().and_then(Weak::upgrade) {
            collector.add_potential_garbage_key(key);
        }
    }
}

impl GarbageSource for ReferenceSet {
    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.indexes
            .lock()
            .expect("poisoned")
            .by_key
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_both_ways() {
        let references = ReferenceSet::new();
        references.add_reference(&key("rooms/a"), 1);
        references.add_reference(&key("rooms/a"), 2);
        references.add_reference(&key("rooms/b"), 1);

        assert!(references.contains_key(&key("rooms/a")));
        assert_eq!(references.references_for_id(1).len(), 2);

        references.remove_reference(&key("rooms/a"), 1);
        assert!(references.contains_key(&key("rooms/a")));
        references.remove_reference(&key("rooms/a"), 2);
        assert!(!references.contains_key(&key("rooms/a")));
    }

    #[test]
    fn remove_by_id_releases_all_its_keys() {
        let references = ReferenceSet::new();
        references.add_reference(&key("rooms/a"), 1);
        references.add_reference(&key("rooms/b"), 1);
        references.add_reference(&key("rooms/b"), 2);

        let released = references.remove_references_for_id(1);
        assert_eq!(released.len(), 2);
        assert!(!references.contains_key(&key("rooms/a")));
        assert!(references.contains_key(&key("rooms/b")));
    }
}
