mod event_manager;
mod query;
mod target_id_generator;
mod view;
mod view_snapshot;

pub use event_manager::{EventManager, OnlineState, Subscription};
pub use query::Query;
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboChange, LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
