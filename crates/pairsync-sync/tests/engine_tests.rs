//! Engine lifecycle and user actions

mod common;

use std::fs;
use std::path::Path;
use std::time::Duration;

use common::{md5_hex, Harness, ROOT_NAME};
use pairsync_core::domain::PairState;
use pairsync_core::ports::IPairStateStore;
use pairsync_sync::{EngineEvent, TOP_LEVEL_REF};

#[tokio::test]
async fn test_init_creates_root_pair_once() {
    let h = Harness::new().await;
    h.engine.init().await.unwrap();
    h.engine.init().await.unwrap();

    let root = h.store.get_state_from_local(Path::new("/")).await.unwrap().unwrap();
    assert_eq!(root.remote_ref.as_deref(), Some(TOP_LEVEL_REF));
    assert_eq!(root.pair_state, PairState::Synchronized);
    assert_eq!(h.store.get_count(None).await.unwrap(), 1);

    let marker = h.engine.local().get_root_id().unwrap().unwrap();
    assert!(marker.ends_with(TOP_LEVEL_REF));
    assert!(marker.contains("engine-1"));
}

#[tokio::test]
async fn test_local_file_is_uploaded() {
    let h = Harness::new().await;
    let root = h.bind_root().await;

    fs::create_dir(h.abs("Docs")).unwrap();
    fs::write(h.abs("Docs/notes.txt"), b"Local content").unwrap();
    h.engine.scan_local().await.unwrap();
    h.sync().await;

    let folder = h.remote.child(&root, "Docs").unwrap();
    let file = h.remote.child(&folder, "notes.txt").unwrap();
    assert_eq!(h.remote.content(&file).unwrap(), b"Local content");

    let pair = h.pair("Docs/notes.txt").await.unwrap();
    assert_eq!(pair.pair_state, PairState::Synchronized);
    assert_eq!(pair.remote_ref.as_deref(), Some(file.as_str()));
    assert_eq!(pair.local_digest.as_deref(), Some(md5_hex(b"Local content").as_str()));
    assert_eq!(
        h.engine
            .local()
            .lookup_remote_ref(&h.rel("Docs/notes.txt"))
            .unwrap()
            .as_deref(),
        Some(file.as_str())
    );

    // The echo of our own upload is not downloaded back
    h.engine.poll_remote().await.unwrap();
    h.sync().await;
    assert_eq!(h.remote.calls().downloads, 0);
}

#[tokio::test]
async fn test_local_edit_is_pushed() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "todo.txt", b"v1");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;

    fs::write(h.abs("todo.txt"), b"version two").unwrap();
    h.engine.scan_local().await.unwrap();
    h.sync().await;

    assert_eq!(h.remote.content(&file).unwrap(), b"version two");
    assert_eq!(h.remote.calls().contents_updated, 1);
    assert_eq!(
        h.pair_of(&file).await.unwrap().pair_state,
        PairState::Synchronized
    );
}

#[tokio::test]
async fn test_remote_edit_is_pulled() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "todo.txt", b"v1");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;

    h.remote.set_content(&file, b"edited on the server");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;

    assert_eq!(fs::read(h.abs("todo.txt")).unwrap(), b"edited on the server");
    assert_eq!(h.remote.calls().downloads, 2);
}

#[tokio::test]
async fn test_local_delete_keeps_remote_and_filters_it() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "keep.txt", b"server copy");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;
    let tree = h.pair_of(&file).await.unwrap().remote_path().unwrap();

    fs::remove_file(h.abs("keep.txt")).unwrap();
    h.engine.scan_local().await.unwrap();
    h.sync().await;

    assert!(h.pair_of(&file).await.is_none());
    assert_eq!(h.remote.content(&file).unwrap(), b"server copy");
    assert_eq!(h.remote.calls().deletes, 0);
    assert!(h.store.is_filter(&tree).await.unwrap());

    // Filtered documents do not come back on the next poll
    h.engine.poll_remote().await.unwrap();
    h.sync().await;
    assert!(!h.abs("keep.txt").exists());
}

#[tokio::test]
async fn test_suspend_holds_the_queue() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let mut events = h.engine.subscribe();

    h.engine.suspend().await.unwrap();
    assert!(h.engine.is_suspended());
    h.remote.add_file(&root, "later.txt", b"later");
    h.engine.poll_remote().await.unwrap();
    assert_eq!(h.engine.process_queue().await, 0);
    assert!(!h.abs("later.txt").exists());

    h.engine.resume().await.unwrap();
    h.sync().await;
    assert_eq!(fs::read(h.abs("later.txt")).unwrap(), b"later");

    assert_eq!(events.recv().await.unwrap(), EngineEvent::Suspended);
    assert_eq!(events.recv().await.unwrap(), EngineEvent::Resumed);
}

#[tokio::test]
async fn test_status_reports_pairs_and_queue() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    h.remote.add_file(&root, "a.txt", b"a");
    h.engine.poll_remote().await.unwrap();

    let status = h.engine.status().await.unwrap();
    assert_eq!(status.uid, "engine-1");
    assert!(!status.running);
    assert_eq!(status.queue.queued(), 1);
    assert!(status.conflicts.is_empty());
    assert!(status.last_sync_date.is_some());

    h.sync().await;
    let status = h.engine.status().await.unwrap();
    assert_eq!(status.queue.queued(), 0);
    assert_eq!(status.pairs, status.synchronized);
}

#[tokio::test]
async fn test_server_options_toggle_features() {
    let h = Harness::new().await;
    h.engine.init().await.unwrap();
    assert_eq!(h.engine.refresh_server_options().await.unwrap(), 0);

    h.remote.set_server_feature("synchronization", false);
    h.remote.set_server_feature("not-a-feature", true);
    assert_eq!(h.engine.refresh_server_options().await.unwrap(), 1);
    assert!(!h.engine.status().await.unwrap().synchronization);

    assert_eq!(h.engine.refresh_server_options().await.unwrap(), 0);
}

#[tokio::test]
async fn test_add_and_remove_filter() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let folder = h.remote.add_folder(&root, "Archive");
    h.remote.add_file(&folder, "old.txt", b"old");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;
    assert!(h.abs("Archive/old.txt").exists());

    let tree = h.pair_of(&folder).await.unwrap().remote_path().unwrap();
    h.engine.add_filter(&tree).await.unwrap();
    h.sync().await;
    assert!(!h.abs("Archive").exists());
    assert!(h.remote.content(&folder).is_some());

    h.engine.remove_filter(&tree).await.unwrap();
    h.sync().await;
    assert_eq!(fs::read(h.abs("Archive/old.txt")).unwrap(), b"old");
}

#[tokio::test]
async fn test_unbind_strips_local_attributes() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    h.remote.add_file(&root, "a.txt", b"a");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;

    let report = h.engine.unbind().await.unwrap();
    assert!(report.attributes >= 2);
    assert_eq!(h.store.get_count(None).await.unwrap(), 0);
    let local = h.engine.local();
    assert_eq!(local.lookup_remote_ref(&h.rel("a.txt")).unwrap(), None);
    assert_eq!(local.get_root_id().unwrap(), None);
    assert_eq!(fs::read(h.abs("a.txt")).unwrap(), b"a");
}

#[tokio::test]
async fn test_sync_and_quit_mirrors_then_stops() {
    let h = Harness::new().await;
    let root = h.remote.add_root(ROOT_NAME);
    let folder = h.remote.add_folder(&root, "Test folder");
    h.remote.add_file(&folder, "joe.txt", b"Some content");
    let mut events = h.engine.subscribe();

    tokio::time::timeout(Duration::from_secs(30), h.engine.sync_and_quit())
        .await
        .expect("sync_and_quit did not finish")
        .unwrap();

    assert_eq!(fs::read(h.abs("Test folder/joe.txt")).unwrap(), b"Some content");
    assert!(!h.engine.is_running());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&EngineEvent::SyncCompleted));
    assert_eq!(seen.last(), Some(&EngineEvent::Stopped));
}

#[tokio::test]
async fn test_start_and_stop() {
    let h = Harness::new().await;
    let mut events = h.engine.subscribe();

    h.engine.start().await.unwrap();
    assert!(h.engine.is_running());
    assert_eq!(events.recv().await.unwrap(), EngineEvent::Started);

    h.engine.stop().await;
    assert!(!h.engine.is_running());
}
