//! Port definitions (hexagonal architecture interfaces)
//!
//! ## Ports Overview
//!
//! - [`IPairStateStore`] - Durable pair-state table, filters, transfers, sessions
//! - [`IRemoteClient`] - Document repository operations and blob transfers
//! - [`IQueueSink`] - Queue admission endpoint notified by the store

pub mod queue;
pub mod remote_client;
pub mod state_store;

pub use queue::{IQueueSink, QueueItem};
pub use remote_client::{
    BatchState, ChangeKind, ChangeSummary, IDownloadStream, IRemoteClient, RemoteChange,
    RemoteError, RemotePermissions, RemoteUser, ScrollBatch,
};
pub use state_store::IPairStateStore;
