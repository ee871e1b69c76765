//! Shared fixtures for the engine tests
//!
//! [`FakeRemote`] is an in-memory document tree implementing
//! `IRemoteClient`: every mutation is appended to a change log the remote
//! watcher polls, and calls are counted so tests can assert on the
//! traffic a synchronization produced.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use pairsync_core::config::{Config, ConfigBuilder};
use pairsync_core::domain::{DocPair, RemoteInfo};
use pairsync_core::features::FeatureFlags;
use pairsync_core::ports::{
    BatchState, ChangeKind, ChangeSummary, IDownloadStream, IPairStateStore, IRemoteClient,
    RemoteChange, RemoteError, RemotePermissions, RemoteUser, ScrollBatch,
};
use pairsync_store::{DatabasePool, SqlitePairStore};
use pairsync_sync::{Engine, TOP_LEVEL_REF};

pub const ROOT_NAME: &str = "Workspace";

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

// ============================================================================
// FakeRemote
// ============================================================================

#[derive(Debug, Clone)]
struct Doc {
    parent: String,
    name: String,
    folderish: bool,
    content: Vec<u8>,
    readable: bool,
}

#[derive(Debug, Clone)]
struct Event {
    id: i64,
    kind: ChangeKind,
    uid: String,
    name: String,
}

/// Counters of the calls a [`FakeRemote`] served
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub moves: usize,
    pub renames: usize,
    pub deletes: usize,
    pub folders_created: usize,
    pub files_created: usize,
    pub contents_updated: usize,
    pub downloads: usize,
    /// `(batch id, chunk index)` in upload order
    pub chunks: Vec<(String, u32)>,
}

impl Calls {
    pub fn uploads(&self) -> usize {
        self.files_created + self.contents_updated
    }
}

#[derive(Default)]
struct State {
    docs: BTreeMap<String, Doc>,
    roots: Vec<String>,
    events: Vec<Event>,
    batches: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    next_uid: u64,
    calls: Calls,
}

type ChunkHook = Box<dyn Fn(u32) + Send + Sync>;

/// In-memory server
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    chunk_hook: Mutex<Option<ChunkHook>>,
    features: Mutex<HashMap<String, bool>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Creates a folder under the top-level container and registers it
    /// as a sync root
    pub fn add_root(&self, name: &str) -> String {
        let uid = self.insert(TOP_LEVEL_REF, name, true, Vec::new());
        let mut state = self.state();
        state.roots.push(uid.clone());
        log(&mut state, ChangeKind::RootRegistered, &uid);
        uid
    }

    /// Publishes a feature toggle in the server configuration
    pub fn set_server_feature(&self, name: &str, enabled: bool) {
        self.features.lock().unwrap().insert(name.to_string(), enabled);
    }

    pub fn add_folder(&self, parent: &str, name: &str) -> String {
        self.insert(parent, name, true, Vec::new())
    }

    pub fn add_file(&self, parent: &str, name: &str, content: &[u8]) -> String {
        self.insert(parent, name, false, content.to_vec())
    }

    fn insert(&self, parent: &str, name: &str, folderish: bool, content: Vec<u8>) -> String {
        let mut state = self.state();
        state.next_uid += 1;
        let uid = format!("doc-{}", state.next_uid);
        state.docs.insert(
            uid.clone(),
            Doc {
                parent: parent.to_string(),
                name: name.to_string(),
                folderish,
                content,
                readable: true,
            },
        );
        log(&mut state, ChangeKind::Created, &uid);
        uid
    }

    /// Replaces the content of a file, as another user would
    pub fn set_content(&self, uid: &str, content: &[u8]) {
        let mut state = self.state();
        if let Some(doc) = state.docs.get_mut(uid) {
            doc.content = content.to_vec();
        }
        log(&mut state, ChangeKind::Modified, uid);
    }

    /// Deletes a document and its subtree, as another user would
    pub fn remove(&self, uid: &str) {
        let mut state = self.state();
        remove_tree(&mut state, uid);
        log(&mut state, ChangeKind::Deleted, uid);
    }

    /// Takes the read permission on a subtree away from the user
    pub fn revoke(&self, uid: &str) {
        let mut state = self.state();
        if let Some(doc) = state.docs.get_mut(uid) {
            doc.readable = false;
        }
        log(&mut state, ChangeKind::SecurityUpdated, uid);
    }

    pub fn grant(&self, uid: &str) {
        let mut state = self.state();
        if let Some(doc) = state.docs.get_mut(uid) {
            doc.readable = true;
        }
        log(&mut state, ChangeKind::SecurityUpdated, uid);
    }

    pub fn content(&self, uid: &str) -> Option<Vec<u8>> {
        let state = self.state();
        visible(&state, uid).then(|| state.docs[uid].content.clone())
    }

    pub fn name(&self, uid: &str) -> Option<String> {
        self.state().docs.get(uid).map(|doc| doc.name.clone())
    }

    pub fn parent(&self, uid: &str) -> Option<String> {
        self.state().docs.get(uid).map(|doc| doc.parent.clone())
    }

    pub fn child(&self, parent: &str, name: &str) -> Option<String> {
        self.state()
            .docs
            .iter()
            .find(|(_, doc)| doc.parent == parent && doc.name == name)
            .map(|(uid, _)| uid.clone())
    }

    pub fn calls(&self) -> Calls {
        self.state().calls.clone()
    }

    /// Runs `hook` after each acknowledged chunk
    pub fn on_chunk(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.chunk_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn clear_chunk_hook(&self) {
        self.chunk_hook.lock().unwrap().take();
    }
}

fn log(state: &mut State, kind: ChangeKind, uid: &str) {
    let id = state.events.len() as i64 + 1;
    let name = state.docs.get(uid).map(|d| d.name.clone()).unwrap_or_default();
    state.events.push(Event {
        id,
        kind,
        uid: uid.to_string(),
        name,
    });
}

fn remove_tree(state: &mut State, uid: &str) {
    let children: Vec<String> = state
        .docs
        .iter()
        .filter(|(_, doc)| doc.parent == uid)
        .map(|(child, _)| child.clone())
        .collect();
    for child in children {
        remove_tree(state, &child);
    }
    state.docs.remove(uid);
    state.roots.retain(|root| root != uid);
}

/// Readable, with every ancestor readable, below a registered root
fn visible(state: &State, uid: &str) -> bool {
    let mut current = uid;
    loop {
        let Some(doc) = state.docs.get(current) else {
            return false;
        };
        if !doc.readable {
            return false;
        }
        if doc.parent == TOP_LEVEL_REF {
            return state.roots.iter().any(|root| root == current);
        }
        current = &doc.parent;
    }
}

fn path_of(state: &State, uid: &str) -> String {
    let mut segments = vec![uid.to_string()];
    let mut current = uid;
    while let Some(doc) = state.docs.get(current) {
        if doc.parent == TOP_LEVEL_REF {
            break;
        }
        segments.push(doc.parent.clone());
        current = &doc.parent;
    }
    segments.reverse();
    format!("/{}", segments.join("/"))
}

fn info_of(state: &State, uid: &str) -> Option<RemoteInfo> {
    if !visible(state, uid) {
        return None;
    }
    let doc = &state.docs[uid];
    let now = Utc::now();
    Some(RemoteInfo {
        uid: uid.to_string(),
        parent_uid: Some(doc.parent.clone()),
        path: path_of(state, uid),
        name: doc.name.clone(),
        folderish: doc.folderish,
        size: doc.content.len() as u64,
        digest: (!doc.folderish).then(|| md5_hex(&doc.content)),
        digest_algorithm: (!doc.folderish).then(|| "md5".to_string()),
        last_modification_time: Some(now),
        creation_time: Some(now),
        last_contributor: Some("Administrator".to_string()),
        download_url: (!doc.folderish).then(|| format!("nxfile/default/{uid}")),
        can_rename: true,
        can_update: true,
        can_delete: true,
        can_create_child: doc.folderish,
        lock_owner: None,
    })
}

fn descendants(state: &State, uid: &str, out: &mut Vec<RemoteInfo>) {
    for (child, doc) in &state.docs {
        if doc.parent == uid {
            if let Some(info) = info_of(state, child) {
                out.push(info);
                descendants(state, child, out);
            }
        }
    }
}

fn not_found(uid: &str) -> RemoteError {
    RemoteError::NotFound(uid.to_string())
}

struct MemoryStream {
    chunks: Vec<Vec<u8>>,
    length: u64,
}

#[async_trait]
impl IDownloadStream for MemoryStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        if self.chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.chunks.remove(0)))
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }
}

#[async_trait]
impl IRemoteClient for FakeRemote {
    async fn fetch_user(&self) -> Result<RemoteUser, RemoteError> {
        Ok(RemoteUser {
            username: "Administrator".to_string(),
            token: Some("token".to_string()),
            server_time: Some(Utc::now()),
        })
    }

    async fn server_features(&self) -> Result<HashMap<String, bool>, RemoteError> {
        Ok(self.features.lock().unwrap().clone())
    }

    async fn get_info(&self, remote_ref: &str) -> Result<Option<RemoteInfo>, RemoteError> {
        Ok(info_of(&self.state(), remote_ref))
    }

    async fn get_children(&self, remote_ref: &str) -> Result<Vec<RemoteInfo>, RemoteError> {
        let state = self.state();
        if !visible(&state, remote_ref) {
            return Err(not_found(remote_ref));
        }
        Ok(state
            .docs
            .iter()
            .filter(|(_, doc)| doc.parent == remote_ref)
            .filter_map(|(uid, _)| info_of(&state, uid))
            .collect())
    }

    async fn scroll_descendants(
        &self,
        remote_ref: &str,
        scroll_id: Option<&str>,
        _batch_size: u32,
    ) -> Result<ScrollBatch, RemoteError> {
        let state = self.state();
        if !visible(&state, remote_ref) {
            return Err(not_found(remote_ref));
        }
        if scroll_id.is_some() {
            return Ok(ScrollBatch::default());
        }
        let mut items = Vec::new();
        descendants(&state, remote_ref, &mut items);
        Ok(ScrollBatch {
            scroll_id: None,
            file_system_items: items,
        })
    }

    async fn make_folder(&self, parent_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError> {
        if !visible(&self.state(), parent_ref) {
            return Err(not_found(parent_ref));
        }
        let uid = self.add_folder(parent_ref, name);
        let mut state = self.state();
        state.calls.folders_created += 1;
        info_of(&state, &uid).ok_or_else(|| not_found(&uid))
    }

    async fn rename(&self, remote_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError> {
        let mut state = self.state();
        if !visible(&state, remote_ref) {
            return Err(not_found(remote_ref));
        }
        if let Some(doc) = state.docs.get_mut(remote_ref) {
            doc.name = name.to_string();
        }
        state.calls.renames += 1;
        log(&mut state, ChangeKind::Moved, remote_ref);
        info_of(&state, remote_ref).ok_or_else(|| not_found(remote_ref))
    }

    async fn move_to(&self, remote_ref: &str, new_parent_ref: &str) -> Result<RemoteInfo, RemoteError> {
        let mut state = self.state();
        if !visible(&state, remote_ref) || !visible(&state, new_parent_ref) {
            return Err(not_found(remote_ref));
        }
        if let Some(doc) = state.docs.get_mut(remote_ref) {
            doc.parent = new_parent_ref.to_string();
        }
        state.calls.moves += 1;
        log(&mut state, ChangeKind::Moved, remote_ref);
        info_of(&state, remote_ref).ok_or_else(|| not_found(remote_ref))
    }

    async fn delete(&self, remote_ref: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        if !visible(&state, remote_ref) {
            return Err(not_found(remote_ref));
        }
        remove_tree(&mut state, remote_ref);
        state.calls.deletes += 1;
        log(&mut state, ChangeKind::Deleted, remote_ref);
        Ok(())
    }

    async fn download(&self, info: &RemoteInfo) -> Result<Box<dyn IDownloadStream>, RemoteError> {
        let mut state = self.state();
        if !visible(&state, &info.uid) {
            return Err(not_found(&info.uid));
        }
        state.calls.downloads += 1;
        let content = state.docs[&info.uid].content.clone();
        Ok(Box::new(MemoryStream {
            length: content.len() as u64,
            chunks: content.chunks(4096).map(<[u8]>::to_vec).collect(),
        }))
    }

    async fn create_batch(&self) -> Result<String, RemoteError> {
        let mut state = self.state();
        let batch_id = format!("batch-{}", state.batches.len() + 1);
        state.batches.insert(batch_id.clone(), BTreeMap::new());
        Ok(batch_id)
    }

    async fn batch_info(&self, batch_id: &str) -> Result<Option<BatchState>, RemoteError> {
        Ok(self.state().batches.get(batch_id).map(|chunks| BatchState {
            batch_id: batch_id.to_string(),
            uploaded_chunk_ids: chunks.keys().copied().collect(),
            chunk_count: None,
        }))
    }

    async fn upload_chunk(
        &self,
        batch_id: &str,
        index: u32,
        _count: u32,
        data: Vec<u8>,
        _filename: &str,
        _filesize: u64,
    ) -> Result<(), RemoteError> {
        {
            let mut state = self.state();
            let Some(chunks) = state.batches.get_mut(batch_id) else {
                return Err(RemoteError::BatchExpired(batch_id.to_string()));
            };
            chunks.insert(index, data);
            state.calls.chunks.push((batch_id.to_string(), index));
        }
        if let Some(hook) = self.chunk_hook.lock().unwrap().as_ref() {
            hook(index);
        }
        Ok(())
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<(), RemoteError> {
        self.state().batches.remove(batch_id);
        Ok(())
    }

    async fn create_file(
        &self,
        parent_ref: &str,
        name: &str,
        batch_id: &str,
        _transaction_timeout: u64,
    ) -> Result<RemoteInfo, RemoteError> {
        let content = {
            let mut state = self.state();
            if !visible(&state, parent_ref) {
                return Err(not_found(parent_ref));
            }
            let chunks = state
                .batches
                .remove(batch_id)
                .ok_or_else(|| RemoteError::BatchExpired(batch_id.to_string()))?;
            state.calls.files_created += 1;
            chunks.into_values().flatten().collect::<Vec<u8>>()
        };
        let uid = self.add_file(parent_ref, name, &content);
        info_of(&self.state(), &uid).ok_or_else(|| not_found(&uid))
    }

    async fn update_content(
        &self,
        remote_ref: &str,
        batch_id: &str,
        _transaction_timeout: u64,
    ) -> Result<RemoteInfo, RemoteError> {
        let content = {
            let mut state = self.state();
            if !visible(&state, remote_ref) {
                return Err(not_found(remote_ref));
            }
            let chunks = state
                .batches
                .remove(batch_id)
                .ok_or_else(|| RemoteError::BatchExpired(batch_id.to_string()))?;
            state.calls.contents_updated += 1;
            chunks.into_values().flatten().collect::<Vec<u8>>()
        };
        self.set_content(remote_ref, &content);
        info_of(&self.state(), remote_ref).ok_or_else(|| not_found(remote_ref))
    }

    async fn get_changes(
        &self,
        last_event_log_id: i64,
        _root_refs: &[String],
    ) -> Result<ChangeSummary, RemoteError> {
        let state = self.state();
        let changes = state
            .events
            .iter()
            .filter(|event| event.id > last_event_log_id)
            .map(|event| RemoteChange {
                event_id: event.kind.clone(),
                event_date: Utc::now().timestamp_millis(),
                file_system_item_id: event.uid.clone(),
                file_system_item_name: Some(event.name.clone()),
                file_system_item: info_of(&state, &event.uid),
            })
            .collect();
        Ok(ChangeSummary {
            upper_bound: state.events.len() as i64,
            active_roots: state.roots.clone(),
            sync_date: Utc::now().timestamp_millis(),
            has_too_many_changes: false,
            file_system_changes: changes,
        })
    }

    async fn get_roots(&self) -> Result<Vec<RemoteInfo>, RemoteError> {
        let state = self.state();
        Ok(state
            .roots
            .iter()
            .filter_map(|uid| info_of(&state, uid))
            .collect())
    }

    async fn register_as_root(&self, remote_ref: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        if !state.docs.contains_key(remote_ref) {
            return Err(not_found(remote_ref));
        }
        if !state.roots.iter().any(|root| root == remote_ref) {
            state.roots.push(remote_ref.to_string());
            log(&mut state, ChangeKind::RootRegistered, remote_ref);
        }
        Ok(())
    }

    async fn unregister_as_root(&self, remote_ref: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.roots.retain(|root| root != remote_ref);
        log(&mut state, ChangeKind::RootUnregistered, remote_ref);
        Ok(())
    }

    async fn permissions(&self, remote_ref: &str) -> Result<RemotePermissions, RemoteError> {
        let state = self.state();
        let doc = state
            .docs
            .get(remote_ref)
            .filter(|_| visible(&state, remote_ref))
            .ok_or_else(|| not_found(remote_ref))?;
        Ok(RemotePermissions {
            can_read: true,
            can_update: true,
            can_rename: true,
            can_delete: true,
            can_create_child: doc.folderish,
        })
    }

    async fn lock(&self, _remote_ref: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn unlock(&self, _remote_ref: &str) -> Result<(), RemoteError> {
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config(home: &Path) -> Config {
    ConfigBuilder::new()
        .nxdrive_home(home.to_path_buf())
        .trash_fallback_delete(true)
        .max_file_processors(2)
        .delay(1)
        .build()
}

/// One account bound to a [`FakeRemote`], driven step by step
pub struct Harness {
    pub home: TempDir,
    pub local_folder: PathBuf,
    pub config: Arc<Config>,
    pub remote: Arc<FakeRemote>,
    pub store: Arc<SqlitePairStore>,
    pub engine: Engine,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config).await
    }

    pub async fn with_config(make_config: impl FnOnce(&Path) -> Config) -> Self {
        let home = TempDir::new().unwrap();
        let config = Arc::new(make_config(home.path()));
        let local_folder = home.path().join("Drive");
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(SqlitePairStore::new(pool.pool().clone()));
        let remote = FakeRemote::new();
        let engine = build_engine(&config, &store, &remote, &local_folder);
        Self {
            home,
            local_folder,
            config,
            remote,
            store,
            engine,
        }
    }

    /// A fresh engine over the same store, server and folder
    pub fn restart(&mut self) {
        self.engine = build_engine(&self.config, &self.store, &self.remote, &self.local_folder);
    }

    /// Registers a sync root and mirrors it locally
    pub async fn bind_root(&self) -> String {
        let root = self.remote.add_root(ROOT_NAME);
        self.engine.init().await.unwrap();
        self.engine.poll_remote().await.unwrap();
        self.sync().await;
        root
    }

    /// Processes the queue until nothing is ready
    pub async fn sync(&self) {
        while self.engine.process_queue().await > 0 {}
    }

    /// One local scan, one remote poll, then processing
    pub async fn round(&self) {
        self.engine.scan_local().await.unwrap();
        self.engine.poll_remote().await.unwrap();
        self.sync().await;
    }

    /// Absolute path of `rel`, relative to the sync root folder
    pub fn abs(&self, rel: &str) -> PathBuf {
        self.local_folder.join(ROOT_NAME).join(rel)
    }

    /// Pair path of `rel`
    pub fn rel(&self, rel: &str) -> PathBuf {
        let mut path = PathBuf::from("/");
        path.push(ROOT_NAME);
        if !rel.is_empty() {
            path.push(rel);
        }
        path
    }

    pub async fn pair(&self, rel: &str) -> Option<DocPair> {
        self.store.get_state_from_local(&self.rel(rel)).await.unwrap()
    }

    pub async fn pair_of(&self, remote_ref: &str) -> Option<DocPair> {
        self.store.get_state_from_remote(remote_ref).await.unwrap()
    }
}

fn build_engine(
    config: &Arc<Config>,
    store: &Arc<SqlitePairStore>,
    remote: &Arc<FakeRemote>,
    local_folder: &Path,
) -> Engine {
    let features = Arc::new(FeatureFlags::from_config(&config.features));
    let store: Arc<dyn IPairStateStore> = store.clone();
    let remote: Arc<dyn IRemoteClient> = remote.clone();
    Engine::new(config.clone(), features, store, remote, local_folder, "engine-1")
}
