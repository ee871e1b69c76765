//! File watching and debounced change queue
//!
//! [`FileWatcher`] wraps the `notify` crate and converts raw OS events into
//! [`ChangeEvent`] values sent over an mpsc channel.
//!
//! [`DebouncedChangeQueue`] coalesces rapid-fire events per path and only
//! releases a path once it has been quiet for the debounce window. Editors
//! save by writing a temporary file, deleting the original and renaming
//! the temporary file into place; the coalescing rules below collapse such
//! sequences into a single modification.
//!
//! ```text
//! inotify / kqueue
//!       │
//!       ▼
//!  FileWatcher ──→ mpsc::channel ──→ DebouncedChangeQueue ──→ LocalWatcher
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of the raw event channel
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// A filesystem change, decoupled from `notify`'s event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    /// Content or metadata changed
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { old: PathBuf, new: PathBuf },
}

impl ChangeEvent {
    /// Primary path of the event (the destination for renames)
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }
}

/// Recursive watcher over one or more directories
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates a watcher and the receiver its events are delivered to
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Dropping change event, receiver is gone");
                        }
                    }
                }
                Err(err) => error!(error = %err, "File watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting recursive watch");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Stopping watch");
        self.watcher
            .unwatch(path)
            .with_context(|| format!("Failed to unwatch path: {}", path.display()))
    }
}

/// Converts a `notify::Event` into a [`ChangeEvent`]
///
/// The two halves of a rename (`Name(From)`, `Name(To)`) map to a deletion
/// and a creation; backends able to pair them also send `Name(Both)`,
/// which the debounced queue merges with the halves. Access events are
/// dropped.
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;
    let change = match &event.kind {
        EventKind::Create(_) => ChangeEvent::Created(paths.first()?.clone()),
        EventKind::Remove(_) => ChangeEvent::Deleted(paths.first()?.clone()),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [old, new, ..] => ChangeEvent::Renamed {
                old: old.clone(),
                new: new.clone(),
            },
            [only] => ChangeEvent::Modified(only.clone()),
            [] => return None,
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            ChangeEvent::Deleted(paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            ChangeEvent::Created(paths.first()?.clone())
        }
        EventKind::Modify(_) => ChangeEvent::Modified(paths.first()?.clone()),
        _ => return None,
    };
    debug!(event = ?change, kind = ?event.kind, "Mapped notify event");
    Some(change)
}

/// Checks that a file is not being written to
///
/// Reads the size twice, `check_interval` apart.
pub async fn is_file_stable(path: &Path, check_interval: Duration) -> bool {
    let Ok(first) = tokio::fs::metadata(path).await.map(|m| m.len()) else {
        return false;
    };
    tokio::time::sleep(check_interval).await;
    let Ok(second) = tokio::fs::metadata(path).await.map(|m| m.len()) else {
        return false;
    };
    let stable = first == second;
    if !stable {
        debug!(path = %path.display(), first, second, "File still growing");
    }
    stable
}

enum Merge {
    Insert(ChangeEvent),
    /// The pending event already describes the path
    Touch(PathBuf),
    Drop(PathBuf),
}

#[derive(Debug)]
struct Pending {
    event: ChangeEvent,
    /// Arrival order of the first event for the path
    seq: u64,
    last_seen: Instant,
}

/// Queue that coalesces rapid filesystem changes per path
///
/// Coalescing rules for a path with a pending event:
/// - `Created` then `Modified` stays `Created`
/// - `Created` then `Deleted` drops both
/// - `Deleted` then `Created` becomes `Modified`
/// - a rename whose source has a pending `Deleted` (the `From` half)
///   replaces it; one whose source has a pending `Created` becomes a
///   creation of the destination
/// - a deletion of a pending rename destination becomes a deletion of
///   the rename source
///
/// Settled events are released in arrival order so that a folder is
/// handled before its children.
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, Pending>,
    debounce_delay: Duration,
    next_seq: u64,
}

impl DebouncedChangeQueue {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
            next_seq: 0,
        }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        debug!(event = ?event, "Enqueuing change event");
        let outcome = match event {
            ChangeEvent::Renamed { old, new } => self.merge_rename(old, new),
            ChangeEvent::Created(path) => match self.pending_event(&path) {
                Some(ChangeEvent::Deleted(_)) => Merge::Insert(ChangeEvent::Modified(path)),
                Some(ChangeEvent::Renamed { .. }) => Merge::Touch(path),
                _ => Merge::Insert(ChangeEvent::Created(path)),
            },
            ChangeEvent::Modified(path) => match self.pending_event(&path) {
                Some(ChangeEvent::Created(_) | ChangeEvent::Renamed { .. }) => Merge::Touch(path),
                _ => Merge::Insert(ChangeEvent::Modified(path)),
            },
            ChangeEvent::Deleted(path) => match self.pending_event(&path) {
                Some(ChangeEvent::Created(_)) => Merge::Drop(path),
                Some(ChangeEvent::Renamed { old, .. }) => {
                    self.pending.remove(&path);
                    Merge::Insert(ChangeEvent::Deleted(old))
                }
                _ => Merge::Insert(ChangeEvent::Deleted(path)),
            },
        };

        match outcome {
            Merge::Insert(event) => self.insert(event),
            Merge::Touch(path) => {
                if let Some(existing) = self.pending.get_mut(&path) {
                    existing.last_seen = Instant::now();
                }
            }
            Merge::Drop(path) => {
                self.pending.remove(&path);
            }
        }
    }

    fn merge_rename(&mut self, old: PathBuf, new: PathBuf) -> Merge {
        let source = self.pending.remove(&old).map(|p| p.event);
        let target = self.pending_event(&new);
        let replaces = matches!(target, Some(ChangeEvent::Deleted(_)));
        match source {
            Some(ChangeEvent::Created(_)) if replaces => Merge::Insert(ChangeEvent::Modified(new)),
            Some(ChangeEvent::Created(_)) => Merge::Insert(ChangeEvent::Created(new)),
            // The source half was already merged away; the destination
            // half describes the outcome
            None if matches!(
                target,
                Some(ChangeEvent::Created(_) | ChangeEvent::Modified(_))
            ) =>
            {
                Merge::Touch(new)
            }
            source => {
                let origin = match source {
                    Some(ChangeEvent::Renamed { old: origin, .. }) => origin,
                    _ => old,
                };
                if replaces {
                    self.insert(ChangeEvent::Deleted(origin));
                    Merge::Insert(ChangeEvent::Modified(new))
                } else {
                    Merge::Insert(ChangeEvent::Renamed { old: origin, new })
                }
            }
        }
    }

    fn pending_event(&self, path: &Path) -> Option<ChangeEvent> {
        self.pending.get(path).map(|p| p.event.clone())
    }

    fn insert(&mut self, event: ChangeEvent) {
        let key = event.path().to_path_buf();
        let seq = match self.pending.get(&key) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.pending.insert(
            key,
            Pending {
                event,
                seq,
                last_seen: Instant::now(),
            },
        );
    }

    /// Returns the events that have been quiet for the debounce window
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let delay = self.debounce_delay;
        self.take(|p| now.duration_since(p.last_seen) >= delay)
    }

    /// Returns every pending event regardless of age
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        self.take(|_| true)
    }

    fn take(&mut self, settled: impl Fn(&Pending) -> bool) -> Vec<ChangeEvent> {
        let keys: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| settled(p))
            .map(|(k, _)| k.clone())
            .collect();
        let mut out: Vec<Pending> = keys
            .iter()
            .filter_map(|k| self.pending.remove(k))
            .collect();
        out.sort_by_key(|p| p.seq);
        if !out.is_empty() {
            debug!(count = out.len(), "Settled change events");
        }
        out.into_iter().map(|p| p.event).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
