use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use firestore_sync_core::core::{ChangeType, Query, SyncState, View};
use firestore_sync_core::local::{
    EagerGarbageCollector, GarbageCollector, LocalStore, MemoryPersistence, User,
};
use firestore_sync_core::model::{
    DocumentKey, DocumentSet, MaybeDocument, Mutation, MutationBatch, MutationBatchResult,
    MutationResult, SnapshotVersion, Timestamp,
};
use firestore_sync_core::remote::{
    DocumentWatchChange, RemoteEvent, WatchChangeAggregator, WatchTargetChange,
    WatchTargetChangeState,
};
use firestore_sync_core::value::ObjectValue;

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn set_mutation(path: &str, data: serde_json::Value) -> Mutation {
    Mutation::set(key(path), ObjectValue::from_json(&data))
}

fn server_doc(path: &str, data: serde_json::Value, version: SnapshotVersion) -> MaybeDocument {
    MaybeDocument::Document(firestore_sync_core::model::Document::new(
        key(path),
        version,
        ObjectValue::from_json(&data),
        false,
    ))
}

fn new_store() -> (Arc<MemoryPersistence>, Arc<dyn GarbageCollector>, LocalStore) {
    let persistence = Arc::new(MemoryPersistence::new());
    let collector: Arc<dyn GarbageCollector> = Arc::new(EagerGarbageCollector::new());
    let store = LocalStore::new(persistence.clone(), User::unauthenticated(), collector.clone());
    (persistence, collector, store)
}

/// A server acknowledgment for a batch of set/delete mutations, all
/// committing at `commit_version`.
fn ack_for(
    batch_id: i32,
    mutations: Vec<Mutation>,
    commit_version: SnapshotVersion,
) -> MutationBatchResult {
    let results = mutations
        .iter()
        .map(|_| MutationResult::new(Some(commit_version)))
        .collect();
    MutationBatchResult::from_batch(
        MutationBatch::new(batch_id, Timestamp::new(1, 0), mutations),
        commit_version,
        results,
        Bytes::from_static(b"stream-token"),
    )
    .unwrap()
}

fn as_view_changes(docs: DocumentSet) -> BTreeMap<DocumentKey, MaybeDocument> {
    docs.into_iter()
        .map(|doc| (doc.key.clone(), MaybeDocument::Document(doc)))
        .collect()
}

#[tokio::test]
async fn local_writes_are_latency_compensated_with_increasing_batch_ids() {
    let (_, _, store) = new_store();
    store.start().await.unwrap();

    let first = store
        .local_write(vec![set_mutation("rooms/1", json!({ "name": "a" }))])
        .await
        .unwrap();
    let second = store
        .local_write(vec![set_mutation("rooms/2", json!({ "name": "b" }))])
        .await
        .unwrap();
    assert!(second.batch_id > first.batch_id);

    let results = store
        .execute_query(&Query::at_path("rooms").unwrap())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|doc| doc.has_local_mutations));
}

#[tokio::test]
async fn out_of_order_acknowledgment_fails_fast() {
    let (_, _, store) = new_store();
    let first_mutation = set_mutation("rooms/1", json!({ "name": "a" }));
    let second_mutation = set_mutation("rooms/2", json!({ "name": "b" }));
    let _first = store.local_write(vec![first_mutation]).await.unwrap();
    let second = store
        .local_write(vec![second_mutation.clone()])
        .await
        .unwrap();

    let err = store
        .acknowledge_batch(ack_for(
            second.batch_id,
            vec![second_mutation],
            SnapshotVersion::from_parts(10, 0),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code_str(), "sync/internal");
}

// Scenario: an acknowledgment arrives before the watch stream has caught up
// to its commit version. The result is held and the write keeps showing as
// pending.
#[tokio::test]
async fn acknowledgment_ahead_of_watch_is_held() {
    let (_, _, store) = new_store();
    let query = Query::at_path("rooms").unwrap();
    store.allocate_query(query.clone()).await.unwrap();

    let mutation = set_mutation("rooms/1", json!({ "name": "a" }));
    let write = store.local_write(vec![mutation.clone()]).await.unwrap();
    assert!(write.changes[&key("rooms/1")].has_local_mutations());

    let changes = store
        .acknowledge_batch(ack_for(
            write.batch_id,
            vec![mutation],
            SnapshotVersion::from_parts(10, 0),
        ))
        .await
        .unwrap();

    // Held, not applied: the local view still shows the pending write.
    assert!(changes[&key("rooms/1")].has_local_mutations());
    let results = store.execute_query(&query).await.unwrap();
    assert!(results.get(&key("rooms/1")).unwrap().has_local_mutations);
}

// Scenario: the watch stream catches up to the held commit version. The held
// result releases and the view emits exactly one metadata-only change.
#[tokio::test]
async fn watch_catch_up_releases_held_result() {
    let (_, _, store) = new_store();
    let query = Query::at_path("rooms").unwrap();
    let query_data = store.allocate_query(query.clone()).await.unwrap();

    let mutation = set_mutation("rooms/1", json!({ "name": "a" }));
    let write = store.local_write(vec![mutation.clone()]).await.unwrap();
    let commit_version = SnapshotVersion::from_parts(10, 0);
    store
        .acknowledge_batch(ack_for(write.batch_id, vec![mutation], commit_version))
        .await
        .unwrap();

    let mut view = View::new(query.clone(), BTreeSet::new());
    let initial = store.execute_query(&query).await.unwrap();
    let fold = view
        .compute_doc_changes(&as_view_changes(initial), None)
        .unwrap();
    let initial_change = view.apply_changes(fold, None).unwrap();
    assert!(initial_change.snapshot.unwrap().from_cache);

    // The server assigns the document to the target at the held commit
    // version and marks the target current at a later snapshot.
    let snapshot_version = SnapshotVersion::from_parts(12, 0);
    let mut aggregator = WatchChangeAggregator::new(
        snapshot_version,
        [query_data.target_id].into_iter().collect(),
    );
    aggregator.handle_document_change(DocumentWatchChange {
        updated_target_ids: vec![query_data.target_id],
        removed_target_ids: vec![],
        key: key("rooms/1"),
        new_doc: Some(server_doc("rooms/1", json!({ "name": "a" }), commit_version)),
    });
    aggregator
        .handle_target_change(
            WatchTargetChange::new(WatchTargetChangeState::Current, vec![query_data.target_id])
                .with_resume_token(Bytes::from_static(b"resume")),
        )
        .unwrap();
    let event = aggregator.create_remote_event();
    let target_change = event.target_changes[&query_data.target_id].clone();

    let changes = store.apply_remote_event(event).await.unwrap();
    assert!(!changes[&key("rooms/1")].has_local_mutations());

    let fold = view.compute_doc_changes(&changes, None).unwrap();
    let view_change = view.apply_changes(fold, Some(&target_change)).unwrap();
    let snapshot = view_change.snapshot.unwrap();
    assert_eq!(snapshot.doc_changes.len(), 1);
    assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Metadata);
    assert!(!snapshot.from_cache);
    assert_eq!(view.sync_state(), Some(SyncState::Synced));
    assert!(view_change.limbo_changes.is_empty());
}

#[tokio::test]
async fn held_results_release_as_an_ordered_prefix() {
    let (_, _, store) = new_store();
    let query = Query::at_path("rooms").unwrap();
    let query_data = store.allocate_query(query.clone()).await.unwrap();

    let mut batch_ids = Vec::new();
    let mutations: Vec<Mutation> = ["rooms/a", "rooms/b", "rooms/c"]
        .iter()
        .map(|path| set_mutation(path, json!({ "v": 1 })))
        .collect();
    for mutation in &mutations {
        let write = store.local_write(vec![mutation.clone()]).await.unwrap();
        batch_ids.push(write.batch_id);
    }
    for (index, mutation) in mutations.iter().enumerate() {
        store
            .acknowledge_batch(ack_for(
                batch_ids[index],
                vec![mutation.clone()],
                SnapshotVersion::from_parts(10 + index as i64, 0),
            ))
            .await
            .unwrap();
    }

    // Watch reaches the second commit version: the first two results
    // release, the third stays held behind it.
    let aggregator = WatchChangeAggregator::new(
        SnapshotVersion::from_parts(11, 0),
        [query_data.target_id].into_iter().collect(),
    );
    let changes = store
        .apply_remote_event(aggregator.create_remote_event())
        .await
        .unwrap();
    assert!(!changes[&key("rooms/a")].has_local_mutations());
    assert!(!changes[&key("rooms/b")].has_local_mutations());
    assert!(!changes.contains_key(&key("rooms/c")));
    let results = store.execute_query(&query).await.unwrap();
    assert!(results.get(&key("rooms/c")).unwrap().has_local_mutations);

    let aggregator = WatchChangeAggregator::new(
        SnapshotVersion::from_parts(12, 0),
        [query_data.target_id].into_iter().collect(),
    );
    let changes = store
        .apply_remote_event(aggregator.create_remote_event())
        .await
        .unwrap();
    assert!(!changes[&key("rooms/c")].has_local_mutations());
}

#[tokio::test]
async fn remote_document_versions_never_regress_except_the_min_sentinel() {
    let (persistence, _, store) = new_store();

    let newer = RemoteEvent {
        snapshot_version: SnapshotVersion::from_parts(5, 0),
        target_changes: BTreeMap::new(),
        document_updates: [(
            key("rooms/1"),
            server_doc("rooms/1", json!({ "v": 5 }), SnapshotVersion::from_parts(5, 0)),
        )]
        .into_iter()
        .collect(),
    };
    store.apply_remote_event(newer).await.unwrap();

    let stale = RemoteEvent {
        snapshot_version: SnapshotVersion::from_parts(5, 0),
        target_changes: BTreeMap::new(),
        document_updates: [(
            key("rooms/1"),
            server_doc("rooms/1", json!({ "v": 3 }), SnapshotVersion::from_parts(3, 0)),
        )]
        .into_iter()
        .collect(),
    };
    store.apply_remote_event(stale).await.unwrap();

    let cache = persistence.remote_document_cache();
    assert_eq!(
        cache.get_entry(&key("rooms/1")).unwrap().version(),
        SnapshotVersion::from_parts(5, 0)
    );

    // A limbo-resolution "confirmed absent" event carries the MIN sentinel
    // and overwrites any cached version.
    let tombstone = RemoteEvent {
        snapshot_version: SnapshotVersion::from_parts(6, 0),
        target_changes: BTreeMap::new(),
        document_updates: [(
            key("rooms/1"),
            MaybeDocument::NoDocument(firestore_sync_core::model::NoDocument::new(
                key("rooms/1"),
                SnapshotVersion::MIN,
            )),
        )]
        .into_iter()
        .collect(),
    };
    store.apply_remote_event(tombstone).await.unwrap();
    assert!(matches!(
        cache.get_entry(&key("rooms/1")),
        Some(MaybeDocument::NoDocument(_))
    ));
}

#[tokio::test]
async fn deleting_from_a_full_limit_window_forces_a_refill() {
    let (persistence, _, store) = new_store();
    let cache = persistence.remote_document_cache();
    for id in ["a", "b", "c"] {
        cache.add_entry(server_doc(
            &format!("rooms/{id}"),
            json!({ "name": id }),
            SnapshotVersion::from_parts(1, 0),
        ));
    }

    let query = Query::at_path("rooms").unwrap().with_limit(2);
    let mut view = View::new(query.clone(), BTreeSet::new());
    let initial = store.execute_query(&query).await.unwrap();
    let fold = view
        .compute_doc_changes(&as_view_changes(initial), None)
        .unwrap();
    view.apply_changes(fold, None).unwrap();
    assert_eq!(view.documents().len(), 2);

    // The second-ranked document goes away locally.
    let write = store
        .local_write(vec![Mutation::delete(key("rooms/b"))])
        .await
        .unwrap();
    let fold = view.compute_doc_changes(&write.changes, None).unwrap();
    assert!(fold.needs_refill);

    // The refill re-queries the local view instead of inventing a result.
    let refill = store.execute_query(&query).await.unwrap();
    let fold = view
        .compute_doc_changes(&as_view_changes(refill), Some(fold))
        .unwrap();
    assert!(!fold.needs_refill);
    let snapshot = view.apply_changes(fold, None).unwrap().snapshot.unwrap();
    let ids: Vec<_> = snapshot
        .docs
        .iter()
        .map(|doc| doc.key.id().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "c"]);
}

#[tokio::test]
async fn pending_writes_pin_documents_until_the_batch_is_removed() {
    let (persistence, _, store) = new_store();
    let mutation = set_mutation("rooms/1", json!({ "name": "a" }));
    let write = store.local_write(vec![mutation.clone()]).await.unwrap();

    // The pending batch references the key, so nothing is collected.
    assert!(store.collect_garbage().await.unwrap().is_empty());

    // No targets are allocated, so the acknowledgment applies immediately
    // and removes the batch, unreferencing the key.
    store
        .acknowledge_batch(ack_for(
            write.batch_id,
            vec![mutation],
            SnapshotVersion::from_parts(10, 0),
        ))
        .await
        .unwrap();
    let cache = persistence.remote_document_cache();
    assert!(cache.get_entry(&key("rooms/1")).is_some());

    let garbage = store.collect_garbage().await.unwrap();
    assert!(garbage.contains(&key("rooms/1")));
    assert!(cache.get_entry(&key("rooms/1")).is_none());
}

#[tokio::test]
async fn empty_remote_event_produces_no_snapshot() {
    let (_, _, store) = new_store();
    let query = Query::at_path("rooms").unwrap();
    let query_data = store.allocate_query(query.clone()).await.unwrap();

    let mut view = View::new(query.clone(), BTreeSet::new());
    let fold = view.compute_doc_changes(&BTreeMap::new(), None).unwrap();
    view.apply_changes(fold, None).unwrap();

    let aggregator = WatchChangeAggregator::new(
        SnapshotVersion::MIN,
        [query_data.target_id].into_iter().collect(),
    );
    let changes = store
        .apply_remote_event(aggregator.create_remote_event())
        .await
        .unwrap();
    assert!(changes.is_empty());

    let fold = view.compute_doc_changes(&changes, None).unwrap();
    let view_change = view.apply_changes(fold, None).unwrap();
    assert!(view_change.snapshot.is_none());
}

#[tokio::test]
async fn releasing_the_last_query_flushes_held_results() {
    let (_, _, store) = new_store();
    let query = Query::at_path("rooms").unwrap();
    store.allocate_query(query.clone()).await.unwrap();

    let mutation = set_mutation("rooms/1", json!({ "name": "a" }));
    let write = store.local_write(vec![mutation.clone()]).await.unwrap();
    let changes = store
        .acknowledge_batch(ack_for(
            write.batch_id,
            vec![mutation],
            SnapshotVersion::from_parts(10, 0),
        ))
        .await
        .unwrap();
    assert!(changes[&key("rooms/1")].has_local_mutations());

    // No watch data will ever arrive once the last target is gone, so the
    // held result must not stay stuck.
    store.release_query(&query).await.unwrap();
    let results = store
        .execute_query(&Query::at_path("rooms").unwrap())
        .await
        .unwrap();
    assert!(!results.get(&key("rooms/1")).unwrap().has_local_mutations);
}

#[tokio::test]
async fn switching_users_swaps_pending_writes_and_reports_affected_documents() {
    let (_, _, store) = new_store();
    store
        .local_write(vec![set_mutation("rooms/1", json!({ "name": "anon" }))])
        .await
        .unwrap();

    let (alice_store, changes) = store.switch_user(User::authenticated("alice")).await.unwrap();
    // The anonymous user's pending write no longer shapes the local view.
    assert!(matches!(
        changes[&key("rooms/1")],
        MaybeDocument::NoDocument(_)
    ));
    let results = alice_store
        .execute_query(&Query::at_path("rooms").unwrap())
        .await
        .unwrap();
    assert!(results.is_empty());

    // Switching back revives the original queue.
    let (store, changes) = alice_store.switch_user(User::unauthenticated()).await.unwrap();
    assert!(changes[&key("rooms/1")].has_local_mutations());
    let results = store
        .execute_query(&Query::at_path("rooms").unwrap())
        .await
        .unwrap();
    assert!(results.get(&key("rooms/1")).unwrap().has_local_mutations);
}

#[tokio::test]
async fn rejecting_a_batch_rolls_back_its_local_effects() {
    let (_, _, store) = new_store();
    let write = store
        .local_write(vec![set_mutation("rooms/1", json!({ "name": "a" }))])
        .await
        .unwrap();

    let changes = store.reject_batch(write.batch_id).await.unwrap();
    assert!(matches!(
        changes[&key("rooms/1")],
        MaybeDocument::NoDocument(_)
    ));

    let err = store.reject_batch(write.batch_id).await.unwrap_err();
    assert_eq!(err.code_str(), "sync/internal");
}
