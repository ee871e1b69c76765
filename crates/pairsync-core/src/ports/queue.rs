//! Queue sink port
//!
//! The store is the canonical notifier: whenever it moves a pair into a
//! processable state it pushes a [`QueueItem`] into the registered sink.
//! The store only keeps a `Weak` handle to the sink so that the engine
//! remains the single owner of both.

use serde::{Deserialize, Serialize};

use crate::domain::{PairId, PairState};

/// Work item naming one pair to process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: PairId,
    pub folderish: bool,
    pub pair_state: PairState,
}

impl QueueItem {
    pub fn new(id: PairId, folderish: bool, pair_state: PairState) -> Self {
        Self {
            id,
            folderish,
            pair_state,
        }
    }
}

/// Receiver of queue admissions
pub trait IQueueSink: Send + Sync {
    /// Admits a pair; implementations coalesce duplicates by id
    fn push(&self, item: QueueItem);
}
