//! Handles shared by the watchers and processors of one engine

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use pairsync_core::config::Config;
use pairsync_core::features::FeatureFlags;
use pairsync_core::ports::{IPairStateStore, IRemoteClient};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::engine::EngineEvent;
use crate::local::{LocalClient, LocalError};
use crate::queue::QueueManager;
use crate::transfer::TransferEngine;
use crate::SyncError;

/// Everything a worker needs, owned by the [`Engine`](crate::Engine)
///
/// Workers get a clone of the context, never a handle to the engine.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn IPairStateStore>,
    pub remote: Arc<dyn IRemoteClient>,
    pub local: Arc<LocalClient>,
    pub queue: Arc<QueueManager>,
    pub transfers: Arc<TransferEngine>,
    pub config: Arc<Config>,
    pub features: Arc<FeatureFlags>,
    pub path_locks: PathLocks,
    pub cancel: CancellationToken,
    pub events: broadcast::Sender<EngineEvent>,
}

impl SyncContext {
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = ?event, "Engine event");
        let _ = self.events.send(event);
    }

    /// Runs a path client call on the blocking pool
    pub async fn local_call<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&LocalClient) -> Result<T, LocalError> + Send + 'static,
        T: Send + 'static,
    {
        let local = self.local.clone();
        tokio::task::spawn_blocking(move || f(&local))
            .await
            .map_err(|e| anyhow::Error::new(e).context("Path client task failed"))?
            .map_err(SyncError::from)
    }
}

/// Soft per-path locks held by processors while they mutate a path
///
/// Paths are compared lowercased so that two processors cannot work on
/// names differing only by case.
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().to_lowercase()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Takes the lock on `path`; `None` while another processor holds it
    pub fn try_lock(&self, path: &Path) -> Option<PathGuard> {
        let key = Self::key(path);
        if !self.lock().insert(key.clone()) {
            return None;
        }
        Some(PathGuard {
            held: self.held.clone(),
            key,
        })
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.lock().contains(&Self::key(path))
    }
}

/// Releases its path when dropped
#[derive(Debug)]
pub struct PathGuard {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_lock_is_exclusive_and_case_insensitive() {
        let locks = PathLocks::new();
        let guard = locks.try_lock(Path::new("/Test folder/joe.txt")).unwrap();
        assert!(locks.try_lock(Path::new("/test FOLDER/JOE.txt")).is_none());
        assert!(locks.is_locked(Path::new("/Test folder/joe.txt")));

        drop(guard);
        assert!(!locks.is_locked(Path::new("/Test folder/joe.txt")));
        assert!(locks.try_lock(Path::new("/test folder/joe.txt")).is_some());
    }
}
