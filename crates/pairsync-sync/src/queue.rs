//! Queue manager
//!
//! Pair ids admitted by the store wait in four partitions drained in the
//! order local folders, remote folders, local files, remote files. File
//! partitions are only served once no folder is queued or in flight, so
//! a child never overtakes the folder it lives in.
//!
//! Failed pairs leave the active partitions for the error park and come
//! back once their retry time has passed. Admissions for a pair that is
//! being processed are deferred until the processor is done with it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pairsync_core::domain::{PairId, Side};
use pairsync_core::ports::{IPairStateStore, IQueueSink, QueueItem};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Interval of the error park requeue cycle
pub const REQUEUE_TICK: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    LocalFolder,
    RemoteFolder,
    LocalFile,
    RemoteFile,
}

impl Partition {
    /// Drain order
    const ORDER: [Partition; 4] = [
        Partition::LocalFolder,
        Partition::RemoteFolder,
        Partition::LocalFile,
        Partition::RemoteFile,
    ];

    /// Partition of an item, `None` for states that are never queued
    pub fn of(item: &QueueItem) -> Option<Self> {
        let side = item.pair_state.origin()?;
        Some(match (side, item.folderish) {
            (Side::Local, true) => Partition::LocalFolder,
            (Side::Remote, true) => Partition::RemoteFolder,
            (Side::Local, false) => Partition::LocalFile,
            (Side::Remote, false) => Partition::RemoteFile,
        })
    }

    fn index(self) -> usize {
        self as usize
    }

    fn is_folder(self) -> bool {
        matches!(self, Partition::LocalFolder | Partition::RemoteFolder)
    }
}

/// Partitions a worker takes items from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Folders,
    Files,
    Generic,
}

impl WorkerRole {
    /// Roles for a pool of `count` workers: one dedicated to folders, one
    /// to files, the rest generic
    pub fn pool(count: usize) -> Vec<WorkerRole> {
        match count {
            0 => Vec::new(),
            1 => vec![WorkerRole::Generic],
            n => {
                let mut roles = vec![WorkerRole::Folders, WorkerRole::Files];
                roles.extend(std::iter::repeat(WorkerRole::Generic).take(n - 2));
                roles
            }
        }
    }
}

/// Typed event stream of the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { id: PairId, partition: Partition },
    Dequeued { id: PairId },
    Parked { id: PairId, retry_in_secs: u64 },
    Requeued { id: PairId },
    GaveUp { id: PairId, reason: String },
    Suspended,
    Resumed,
    /// No item is queued nor in flight
    Empty,
}

/// Snapshot of the queue sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub local_folders: usize,
    pub remote_folders: usize,
    pub local_files: usize,
    pub remote_files: usize,
    pub in_flight: usize,
    pub errors: usize,
    pub suspended: bool,
}

impl QueueMetrics {
    pub fn queued(&self) -> usize {
        self.local_folders + self.remote_folders + self.local_files + self.remote_files
    }
}

#[derive(Debug)]
struct Parked {
    item: QueueItem,
    next_try: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    partitions: [VecDeque<QueueItem>; 4],
    queued: HashSet<PairId>,
    /// Folderishness of the items handed to workers
    in_flight: HashMap<PairId, bool>,
    /// Admissions received while the pair was in flight
    deferred: HashMap<PairId, QueueItem>,
    errors: HashMap<PairId, Parked>,
    suspended: bool,
}

impl Inner {
    fn enqueue(&mut self, item: QueueItem, front: bool) -> Option<Partition> {
        let partition = Partition::of(&item)?;
        if !self.queued.insert(item.id) {
            return None;
        }
        let queue = &mut self.partitions[partition.index()];
        if front {
            queue.push_front(item);
        } else {
            queue.push_back(item);
        }
        Some(partition)
    }

    fn remove_queued(&mut self, id: PairId) {
        if self.queued.remove(&id) {
            for queue in &mut self.partitions {
                queue.retain(|item| item.id != id);
            }
        }
    }

    fn folders_pending(&self) -> bool {
        !self.partitions[Partition::LocalFolder.index()].is_empty()
            || !self.partitions[Partition::RemoteFolder.index()].is_empty()
            || self.in_flight.values().any(|folderish| *folderish)
    }

    fn pop(&mut self, role: WorkerRole) -> Option<QueueItem> {
        if self.suspended {
            return None;
        }
        let files_allowed = !self.folders_pending();
        let item = Partition::ORDER
            .iter()
            .filter(|p| match role {
                WorkerRole::Folders => p.is_folder(),
                WorkerRole::Files => !p.is_folder(),
                WorkerRole::Generic => true,
            })
            .filter(|p| p.is_folder() || files_allowed)
            .find_map(|p| self.partitions[p.index()].pop_front())?;
        self.queued.remove(&item.id);
        self.in_flight.insert(item.id, item.folderish);
        Some(item)
    }

    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty() && self.deferred.is_empty()
    }

    fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            local_folders: self.partitions[Partition::LocalFolder.index()].len(),
            remote_folders: self.partitions[Partition::RemoteFolder.index()].len(),
            local_files: self.partitions[Partition::LocalFile.index()].len(),
            remote_files: self.partitions[Partition::RemoteFile.index()].len(),
            in_flight: self.in_flight.len(),
            errors: self.errors.len(),
            suspended: self.suspended,
        }
    }
}

/// Thread-safe broker between the store and the processors
pub struct QueueManager {
    inner: Mutex<Inner>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: QueueEvent) {
        trace!(event = ?event, "Queue event");
        // No subscriber is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Loads every processable pair of the store (startup requeue)
    pub async fn init(&self, store: &dyn IPairStateStore) -> anyhow::Result<usize> {
        let items = store.get_queue_items().await?;
        let count = items.len();
        for item in items {
            self.push(item);
        }
        info!(count, "Queue initialized from the store");
        Ok(count)
    }

    fn admit(&self, item: QueueItem, user: bool) {
        let mut inner = self.lock();
        if inner.in_flight.contains_key(&item.id) {
            debug!(pair_id = %item.id, "Pair in flight, deferring admission");
            inner.deferred.insert(item.id, item);
            return;
        }
        if user {
            inner.errors.remove(&item.id);
            inner.remove_queued(item.id);
        } else if let Some(parked) = inner.errors.get_mut(&item.id) {
            trace!(pair_id = %item.id, "Pair parked, refreshing its item");
            parked.item = item;
            return;
        }
        let front = user || item.pair_state.is_deletion() || item.pair_state.is_resolution();
        let Some(partition) = inner.enqueue(item, front) else {
            return;
        };
        drop(inner);
        debug!(pair_id = %item.id, state = %item.pair_state, ?partition, "Pair enqueued");
        self.emit(QueueEvent::Enqueued {
            id: item.id,
            partition,
        });
        self.notify.notify_waiters();
    }

    /// Admits a user-initiated item ahead of everything else, pulling it
    /// out of the error park if needed
    pub fn push_user(&self, item: QueueItem) {
        self.admit(item, true);
    }

    /// Takes the next item for `role` without waiting
    pub fn try_next(&self, role: WorkerRole) -> Option<QueueItem> {
        let item = self.lock().pop(role)?;
        trace!(pair_id = %item.id, ?role, "Pair dequeued");
        self.emit(QueueEvent::Dequeued { id: item.id });
        Some(item)
    }

    /// Waits for the next item for `role`; `None` once cancelled
    pub async fn next(&self, role: WorkerRole, cancel: &CancellationToken) -> Option<QueueItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_next(role) {
                return Some(item);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
                // Folder completions release file partitions without an admission
                _ = tokio::time::sleep(REQUEUE_TICK) => {}
            }
        }
    }

    /// Marks an item as processed
    pub fn done(&self, id: PairId) {
        let mut inner = self.lock();
        inner.in_flight.remove(&id);
        let deferred = inner.deferred.remove(&id);
        let idle = deferred.is_none() && inner.is_idle();
        drop(inner);
        if let Some(item) = deferred {
            self.push(item);
        }
        self.notify.notify_waiters();
        if idle {
            self.emit(QueueEvent::Empty);
        }
    }

    /// Moves an item to the error park for `delay`
    pub fn park(&self, item: QueueItem, delay: Duration) {
        let mut inner = self.lock();
        inner.in_flight.remove(&item.id);
        inner.remove_queued(item.id);
        let item = inner.deferred.remove(&item.id).unwrap_or(item);
        inner.errors.insert(
            item.id,
            Parked {
                item,
                next_try: Instant::now() + delay,
            },
        );
        let idle = inner.is_idle();
        drop(inner);
        debug!(pair_id = %item.id, delay_secs = delay.as_secs(), "Pair parked");
        self.emit(QueueEvent::Parked {
            id: item.id,
            retry_in_secs: delay.as_secs(),
        });
        self.notify.notify_waiters();
        if idle {
            self.emit(QueueEvent::Empty);
        }
    }

    /// Forgets an item for good (terminal state reached)
    pub fn give_up(&self, id: PairId, reason: &str) {
        let mut inner = self.lock();
        inner.in_flight.remove(&id);
        inner.deferred.remove(&id);
        inner.errors.remove(&id);
        inner.remove_queued(id);
        let idle = inner.is_idle();
        drop(inner);
        info!(pair_id = %id, reason, "Giving up on pair");
        self.emit(QueueEvent::GaveUp {
            id,
            reason: reason.to_string(),
        });
        self.notify.notify_waiters();
        if idle {
            self.emit(QueueEvent::Empty);
        }
    }

    /// Returns parked items whose retry time has passed to the queue
    pub fn requeue_errors(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let due: Vec<PairId> = inner
            .errors
            .iter()
            .filter(|(_, parked)| parked.next_try <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut requeued = Vec::with_capacity(due.len());
        for id in due {
            if let Some(parked) = inner.errors.remove(&id) {
                if inner.enqueue(parked.item, false).is_some() {
                    requeued.push(id);
                }
            }
        }
        drop(inner);
        for id in &requeued {
            debug!(pair_id = %id, "Pair requeued from the error park");
            self.emit(QueueEvent::Requeued { id: *id });
        }
        if !requeued.is_empty() {
            self.notify.notify_waiters();
        }
        requeued.len()
    }

    /// Runs the requeue cycle until cancelled
    pub async fn run_requeue(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(REQUEUE_TICK);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.requeue_errors();
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Stops handing out items; in-flight work is left alone
    pub fn suspend(&self) {
        let mut inner = self.lock();
        if inner.suspended {
            return;
        }
        inner.suspended = true;
        drop(inner);
        info!("Queue suspended");
        self.emit(QueueEvent::Suspended);
    }

    pub fn resume(&self) {
        let mut inner = self.lock();
        if !inner.suspended {
            return;
        }
        inner.suspended = false;
        drop(inner);
        info!("Queue resumed");
        self.emit(QueueEvent::Resumed);
        self.notify.notify_waiters();
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// True when nothing is queued nor in flight; parked errors do not count
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    pub fn is_parked(&self, id: PairId) -> bool {
        self.lock().errors.contains_key(&id)
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.lock().metrics()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IQueueSink for QueueManager {
    fn push(&self, item: QueueItem) {
        self.admit(item, false);
    }
}
