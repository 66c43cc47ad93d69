mod remote_event;
mod watch_change;
mod watch_change_aggregator;

pub use remote_event::{CurrentStatusUpdate, RemoteEvent, TargetChange, TargetMapping};
pub use watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
pub use watch_change_aggregator::WatchChangeAggregator;
