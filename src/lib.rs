//! Local-first synchronization core for a document database client.
//!
//! The crate keeps an offline-capable, latency-compensated view of a remote
//! document store: local writes apply immediately through a pending-mutation
//! overlay, the server's watch stream is folded into consistent
//! [`remote::RemoteEvent`]s, and per-query [`core::View`]s diff the resulting
//! local documents into ordered snapshots for listeners.
//!
//! [`local::LocalStore`] is the main entry point; it runs every state change
//! as one serialized transaction against [`local::MemoryPersistence`].

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use error::{SyncError, SyncErrorCode, SyncResult};
