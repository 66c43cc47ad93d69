use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use log::debug;

use crate::error::{internal_error, SyncResult};
use crate::model::{DocumentKey, MaybeDocument, SnapshotVersion, TargetId};
use crate::remote::remote_event::{CurrentStatusUpdate, RemoteEvent, TargetChange, TargetMapping};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};

/// Accumulated per-target state while one server message batch is folded.
#[derive(Debug)]
struct TargetState {
    /// Listen/unlisten requests sent but not yet acknowledged by the stream.
    /// Document fan-in is ignored until the count returns to zero, since it
    /// may belong to a previous incarnation of the target id.
    pending_responses: u32,
    mapping: Option<TargetMapping>,
    current_status: CurrentStatusUpdate,
    resume_token: Bytes,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            mapping: None,
            current_status: CurrentStatusUpdate::None,
            resume_token: Bytes::new(),
        }
    }

    /// Resume tokens are cursors; an empty one carries no information and
    /// must never clobber a real one.
    fn update_resume_token(&mut self, token: &Bytes) {
        if !token.is_empty() {
            self.resume_token = token.clone();
        }
    }
}

/// Folds raw watch-stream changes into one [`RemoteEvent`].
///
/// One aggregator lives for exactly one server message batch:
/// [`create_remote_event`](Self::create_remote_event) consumes it, so nothing
/// can be folded in after the event is built.
pub struct WatchChangeAggregator {
    snapshot_version: SnapshotVersion,
    /// Target ids the caller is still listening to. Fan-in for any other id
    /// is dropped.
    listen_targets: BTreeSet<TargetId>,
    target_states: BTreeMap<TargetId, TargetState>,
    document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    existence_filters: BTreeMap<TargetId, usize>,
}

impl WatchChangeAggregator {
    pub fn new(snapshot_version: SnapshotVersion, listen_targets: BTreeSet<TargetId>) -> Self {
        Self {
            snapshot_version,
            listen_targets,
            target_states: BTreeMap::new(),
            document_updates: BTreeMap::new(),
            existence_filters: BTreeMap::new(),
        }
    }

    /// Records that a listen or unlisten request was sent for `target_id`.
    /// The next target `Added`/`Removed` acknowledgment pays it back.
    pub fn record_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// A target is active when it is still listened to and the stream has
    /// acknowledged every outstanding request for it.
    pub fn is_active_target(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains(&target_id)
            && self
                .target_states
                .get(&target_id)
                .map_or(true, |state| state.pending_responses == 0)
    }

    /// Routes a raw watch-stream event to its handler.
    pub fn handle_change(&mut self, change: WatchChange) -> SyncResult<()> {
        match change {
            WatchChange::Document(change) => {
                self.handle_document_change(change);
                Ok(())
            }
            WatchChange::Target(change) => self.handle_target_change(change),
            WatchChange::Filter(change) => {
                self.handle_existence_filter(change);
                Ok(())
            }
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        let mut relevant = false;

        for target_id in &change.updated_target_ids {
            if self.is_active_target(*target_id) {
                self.ensure_target_mapping(*target_id).add(change.key.clone());
                relevant = true;
            }
        }
        for target_id in &change.removed_target_ids {
            if self.is_active_target(*target_id) {
                self.ensure_target_mapping(*target_id)
                    .remove(change.key.clone());
                relevant = true;
            }
        }

        if !relevant {
            debug!(
                "WatchChangeAggregator: dropping document change for inactive targets: {}",
                change.key
            );
            return;
        }
        if let Some(doc) = change.new_doc {
            self.document_updates.insert(change.key, doc);
        }
    }

    pub fn handle_target_change(&mut self, change: WatchTargetChange) -> SyncResult<()> {
        for target_id in self.affected_target_ids(&change.target_ids) {
            let state = self.ensure_target_state(target_id);
            match change.state {
                WatchTargetChangeState::NoChange => {}
                WatchTargetChangeState::Added => {
                    state.pending_responses = state.pending_responses.saturating_sub(1);
                }
                WatchTargetChangeState::Removed => {
                    // Removals with a cause are handled by the transport
                    // layer before reaching this fold.
                    if change.cause.is_some() {
                        return Err(internal_error(
                            "WatchChangeAggregator received an unhandled target removal cause",
                        ));
                    }
                    state.pending_responses = state.pending_responses.saturating_sub(1);
                }
                WatchTargetChangeState::Current => {
                    state.current_status = CurrentStatusUpdate::MarkCurrent;
                }
                WatchTargetChangeState::Reset => {
                    // Discards any accumulated update mapping; document
                    // changes after this mutate the reset set.
                    state.mapping = Some(TargetMapping::Reset(BTreeSet::new()));
                }
            }
            state.update_resume_token(&change.resume_token);
        }
        Ok(())
    }

    pub fn handle_existence_filter(&mut self, change: ExistenceFilterChange) {
        if self.is_active_target(change.target_id) {
            self.existence_filters.insert(change.target_id, change.count);
        }
    }

    /// Filters recorded this batch, for the caller to compare against its
    /// local counts and re-listen on mismatch.
    pub fn existence_filters(&self) -> &BTreeMap<TargetId, usize> {
        &self.existence_filters
    }

    /// Builds the remote event, dropping state for targets that ended up
    /// inactive. Consumes the aggregator: one fold, one event.
    pub fn create_remote_event(self) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        for (target_id, state) in &self.target_states {
            if !self.is_active_target(*target_id) {
                continue;
            }
            target_changes.insert(
                *target_id,
                TargetChange {
                    mapping: state.mapping.clone(),
                    current_status: state.current_status,
                    resume_token: state.resume_token.clone(),
                    snapshot_version: self.snapshot_version,
                },
            );
        }

        RemoteEvent {
            snapshot_version: self.snapshot_version,
            target_changes,
            document_updates: self.document_updates,
        }
    }

    /// An empty target-id list on a watch change addresses every listened
    /// target.
    fn affected_target_ids(&self, target_ids: &[TargetId]) -> Vec<TargetId> {
        if target_ids.is_empty() {
            self.listen_targets.iter().copied().collect()
        } else {
            target_ids.to_vec()
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn ensure_target_mapping(&mut self, target_id: TargetId) -> &mut TargetMapping {
        self.ensure_target_state(target_id)
            .mapping
            .get_or_insert_with(TargetMapping::empty_update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Document, NoDocument};
    use crate::value::ObjectValue;
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc_change(path: &str, updated: Vec<TargetId>, removed: Vec<TargetId>) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated,
            removed_target_ids: removed,
            key: key(path),
            new_doc: Some(MaybeDocument::Document(Document::new(
                key(path),
                SnapshotVersion::from_parts(1, 0),
                ObjectValue::from_json(&json!({ "name": "eros" })),
                false,
            ))),
        }
    }

    fn aggregator(targets: &[TargetId]) -> WatchChangeAggregator {
        WatchChangeAggregator::new(
            SnapshotVersion::from_parts(2, 0),
            targets.iter().copied().collect(),
        )
    }

    #[test]
    fn folds_document_changes_into_update_mappings() {
        let mut agg = aggregator(&[1, 2]);
        agg.handle_change(WatchChange::Document(doc_change(
            "rooms/eros",
            vec![1],
            vec![2],
        )))
        .unwrap();

        let event = agg.create_remote_event();
        assert_eq!(event.document_updates.len(), 1);
        match &event.target_changes[&1].mapping {
            Some(TargetMapping::Update { added, removed }) => {
                assert!(added.contains(&key("rooms/eros")));
                assert!(removed.is_empty());
            }
            other => panic!("expected update mapping, got {other:?}"),
        }
        match &event.target_changes[&2].mapping {
            Some(TargetMapping::Update { added, removed }) => {
                assert!(added.is_empty());
                assert!(removed.contains(&key("rooms/eros")));
            }
            other => panic!("expected update mapping, got {other:?}"),
        }
    }

    #[test]
    fn drops_fan_in_for_unlistened_targets() {
        let mut agg = aggregator(&[1]);
        agg.handle_document_change(doc_change("rooms/eros", vec![7], vec![]));

        let event = agg.create_remote_event();
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn pending_requests_gate_fan_in_until_acknowledged() {
        let mut agg = aggregator(&[1]);
        agg.record_target_request(1);
        assert!(!agg.is_active_target(1));

        agg.handle_document_change(doc_change("rooms/eros", vec![1], vec![]));
        agg.handle_target_change(WatchTargetChange::new(
            WatchTargetChangeState::Added,
            vec![1],
        ))
        .unwrap();
        assert!(agg.is_active_target(1));
        agg.handle_document_change(doc_change("rooms/other", vec![1], vec![]));

        let event = agg.create_remote_event();
        assert_eq!(event.document_updates.len(), 1);
        assert!(event.document_updates.contains_key(&key("rooms/other")));
    }

    #[test]
    fn reset_discards_accumulated_update_mapping() {
        let mut agg = aggregator(&[1]);
        agg.handle_document_change(doc_change("rooms/eros", vec![1], vec![]));
        agg.handle_target_change(WatchTargetChange::new(
            WatchTargetChangeState::Reset,
            vec![1],
        ))
        .unwrap();
        agg.handle_document_change(doc_change("rooms/other", vec![1], vec![]));

        let event = agg.create_remote_event();
        match &event.target_changes[&1].mapping {
            Some(TargetMapping::Reset(documents)) => {
                assert!(documents.contains(&key("rooms/other")));
                assert!(!documents.contains(&key("rooms/eros")));
            }
            other => panic!("expected reset mapping, got {other:?}"),
        }
    }

    #[test]
    fn current_marks_target_and_empty_target_list_means_all() {
        let mut agg = aggregator(&[1, 2]);
        agg.handle_target_change(WatchTargetChange::new(
            WatchTargetChangeState::Current,
            vec![],
        ))
        .unwrap();

        let event = agg.create_remote_event();
        assert_eq!(
            event.target_changes[&1].current_status,
            CurrentStatusUpdate::MarkCurrent
        );
        assert_eq!(
            event.target_changes[&2].current_status,
            CurrentStatusUpdate::MarkCurrent
        );
    }

    #[test]
    fn empty_resume_token_never_clears_a_real_one() {
        let mut agg = aggregator(&[1]);
        agg.handle_target_change(
            WatchTargetChange::new(WatchTargetChangeState::NoChange, vec![1])
                .with_resume_token(Bytes::from_static(b"token-1")),
        )
        .unwrap();
        agg.handle_target_change(WatchTargetChange::new(
            WatchTargetChangeState::NoChange,
            vec![1],
        ))
        .unwrap();

        let event = agg.create_remote_event();
        assert_eq!(
            event.target_changes[&1].resume_token,
            Bytes::from_static(b"token-1")
        );
    }

    #[test]
    fn records_existence_filters_for_active_targets() {
        let mut agg = aggregator(&[1]);
        agg.handle_existence_filter(ExistenceFilterChange {
            target_id: 1,
            count: 3,
        });
        agg.handle_existence_filter(ExistenceFilterChange {
            target_id: 9,
            count: 5,
        });
        assert_eq!(agg.existence_filters().get(&1), Some(&3));
        assert_eq!(agg.existence_filters().get(&9), None);
    }

    #[test]
    fn tombstones_flow_through_document_updates() {
        let mut agg = aggregator(&[1]);
        agg.handle_document_change(DocumentWatchChange {
            updated_target_ids: vec![],
            removed_target_ids: vec![1],
            key: key("rooms/eros"),
            new_doc: Some(MaybeDocument::NoDocument(NoDocument::new(
                key("rooms/eros"),
                SnapshotVersion::from_parts(2, 0),
            ))),
        });

        let event = agg.create_remote_event();
        assert!(matches!(
            event.document_updates.get(&key("rooms/eros")),
            Some(MaybeDocument::NoDocument(_))
        ));
    }
}
