use std::collections::HashMap;

use log::debug;

use crate::core::view_snapshot::ViewSnapshot;
use crate::core::Query;

/// The client's view of its connection to the backend, as reported by the
/// remote layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Handle returned by [`EventManager::subscribe`]. Snapshots arrive on
/// `receiver`; dropping the handle (or the receiver) without unsubscribing
/// simply stops delivery for this listener.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    query: Query,
    pub receiver: async_channel::Receiver<ViewSnapshot>,
}

impl Subscription {
    pub fn query(&self) -> &Query {
        &self.query
    }
}

struct QueryListener {
    id: u64,
    sender: async_channel::Sender<ViewSnapshot>,
    raised_initial_event: bool,
}

impl QueryListener {
    /// The initial event must not surface a from-cache result while the
    /// connection state is still unresolved; once the client is known to be
    /// offline the cached result is the best it will get.
    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        !snapshot.from_cache || online_state == OnlineState::Offline
    }

    /// Returns false when the receiving side is gone.
    fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !self.raised_initial_event {
            if !self.should_raise_initial_event(snapshot, online_state) {
                return true;
            }
            self.raised_initial_event = true;
        }
        self.sender.try_send(snapshot.clone()).is_ok()
    }
}

/// One listened query and everyone interested in it. Many listeners share
/// the single underlying view.
struct QueryGroup {
    query: Query,
    listeners: Vec<QueryListener>,
    /// Latest snapshot, replayed to listeners that join late and to listeners
    /// whose initial event was held back waiting for the online state.
    view_snapshot: Option<ViewSnapshot>,
}

/// Fans view snapshots out to subscribers.
///
/// Groups listeners by query so that each distinct query is listened to once
/// no matter how many subscriptions it has. Buckets are keyed by canonical id
/// and disambiguated by structural equality, since canonical ids may collide.
pub struct EventManager {
    groups: HashMap<String, Vec<QueryGroup>>,
    online_state: OnlineState,
    next_listener_id: u64,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            online_state: OnlineState::Unknown,
            next_listener_id: 0,
        }
    }

    /// Registers a listener for `query`. The returned bool is true when this
    /// is the first listener for the query, i.e. the caller must start
    /// listening to it.
    pub fn subscribe(&mut self, query: Query) -> (Subscription, bool) {
        let (sender, receiver) = async_channel::unbounded();
        let id = self.next_listener_id;
        self.next_listener_id += 1;

        let bucket = self.groups.entry(query.canonical_id()).or_default();
        let group_index = match bucket.iter().position(|group| group.query == query) {
            Some(index) => index,
            None => {
                debug!("EventManager: first listen to {}", query.canonical_id());
                bucket.push(QueryGroup {
                    query: query.clone(),
                    listeners: Vec::new(),
                    view_snapshot: None,
                });
                bucket.len() - 1
            }
        };
        let group = &mut bucket[group_index];

        let first_listen = group.listeners.is_empty();
        let mut listener = QueryListener {
            id,
            sender,
            raised_initial_event: false,
        };
        if let Some(snapshot) = &group.view_snapshot {
            listener.on_view_snapshot(snapshot, self.online_state);
        }
        group.listeners.push(listener);

        (
            Subscription {
                id,
                query,
                receiver,
            },
            first_listen,
        )
    }

    /// Removes the listener behind `subscription`. Idempotent: unsubscribing
    /// twice is a no-op. Returns true when the query has no listeners left
    /// and the caller should stop listening to it.
    pub fn unsubscribe(&mut self, subscription: &Subscription) -> bool {
        let canonical_id = subscription.query.canonical_id();
        let Some(bucket) = self.groups.get_mut(&canonical_id) else {
            return false;
        };
        let Some(group_index) = bucket
            .iter()
            .position(|group| group.query == subscription.query)
        else {
            return false;
        };

        let group = &mut bucket[group_index];
        let before = group.listeners.len();
        group.listeners.retain(|listener| listener.id != subscription.id);
        if group.listeners.len() == before {
            return false;
        }

        let last = group.listeners.is_empty();
        if last {
            bucket.remove(group_index);
            if bucket.is_empty() {
                self.groups.remove(&canonical_id);
            }
        }
        last
    }

    /// Delivers a new snapshot to every listener of its query, dropping
    /// listeners whose receivers are gone.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) {
        let Some(bucket) = self.groups.get_mut(&snapshot.query.canonical_id()) else {
            return;
        };
        let Some(group) = bucket.iter_mut().find(|group| group.query == snapshot.query) else {
            return;
        };

        let online_state = self.online_state;
        group
            .listeners
            .retain_mut(|listener| listener.on_view_snapshot(&snapshot, online_state));
        group.view_snapshot = Some(snapshot);
    }

    /// Records the new online state and re-evaluates held-back initial
    /// events; going offline releases cached initial snapshots.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for bucket in self.groups.values_mut() {
            for group in bucket.iter_mut() {
                let Some(snapshot) = group.view_snapshot.clone() else {
                    continue;
                };
                group.listeners.retain_mut(|listener| {
                    if listener.raised_initial_event {
                        return true;
                    }
                    listener.on_view_snapshot(&snapshot, online_state)
                });
            }
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Document, DocumentKey, DocumentSet, SnapshotVersion};
    use crate::value::ObjectValue;
    use serde_json::json;

    fn snapshot(query: &Query, from_cache: bool) -> ViewSnapshot {
        let mut docs = DocumentSet::new();
        docs.add(Document::new(
            DocumentKey::from_string("rooms/eros").unwrap(),
            SnapshotVersion::from_parts(1, 0),
            ObjectValue::from_json(&json!({ "name": "eros" })),
            false,
        ));
        ViewSnapshot {
            query: query.clone(),
            docs: docs.clone(),
            old_docs: DocumentSet::new(),
            doc_changes: Vec::new(),
            from_cache,
            has_pending_writes: false,
            sync_state_changed: true,
        }
    }

    #[test]
    fn first_and_last_listener_are_reported() {
        let mut manager = EventManager::new();
        let query = Query::at_path("rooms").unwrap();
        let (first, is_first) = manager.subscribe(query.clone());
        assert!(is_first);
        let (second, is_first) = manager.subscribe(query.clone());
        assert!(!is_first);

        assert!(!manager.unsubscribe(&first));
        assert!(!manager.unsubscribe(&first));
        assert!(manager.unsubscribe(&second));
    }

    #[tokio::test]
    async fn delivers_snapshots_to_all_listeners() {
        let mut manager = EventManager::new();
        let query = Query::at_path("rooms").unwrap();
        let (first, _) = manager.subscribe(query.clone());
        let (second, _) = manager.subscribe(query.clone());

        manager.on_view_snapshot(snapshot(&query, false));
        assert!(!first.receiver.recv().await.unwrap().from_cache);
        assert!(!second.receiver.recv().await.unwrap().from_cache);
    }

    #[tokio::test]
    async fn holds_cached_initial_event_until_offline() {
        let mut manager = EventManager::new();
        let query = Query::at_path("rooms").unwrap();
        let (subscription, _) = manager.subscribe(query.clone());

        manager.on_view_snapshot(snapshot(&query, true));
        assert!(subscription.receiver.try_recv().is_err());

        manager.apply_online_state_change(OnlineState::Offline);
        assert!(subscription.receiver.try_recv().unwrap().from_cache);
    }

    #[tokio::test]
    async fn late_listener_gets_the_current_snapshot() {
        let mut manager = EventManager::new();
        let query = Query::at_path("rooms").unwrap();
        let (_first, _) = manager.subscribe(query.clone());
        manager.on_view_snapshot(snapshot(&query, false));

        let (late, is_first) = manager.subscribe(query.clone());
        assert!(!is_first);
        assert_eq!(late.receiver.try_recv().unwrap().docs.len(), 1);
    }

    #[test]
    fn distinct_queries_get_their_own_groups() {
        let mut manager = EventManager::new();
        let query = Query::at_path("rooms").unwrap();
        let limited = query.clone().with_limit(1);
        let (_a, first_a) = manager.subscribe(query);
        let (_b, first_b) = manager.subscribe(limited);
        assert!(first_a);
        assert!(first_b);
    }
}
