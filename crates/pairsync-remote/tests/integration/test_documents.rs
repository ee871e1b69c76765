//! Integration tests for file-system item operations and status mapping

use pairsync_core::ports::{IRemoteClient, RemoteError};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

// ============================================================================
// Lookups
// ============================================================================

#[tokio::test]
async fn test_get_info_converts_item() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.GetFileSystemItem"))
        .and(header("X-Authentication-Token", common::TEST_TOKEN))
        .and(body_partial_json(serde_json::json!({"params": {"id": "doc-1"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item("doc-1", "folder-1", "joe.txt")),
        )
        .mount(&server)
        .await;

    let info = remote
        .get_info("doc-1")
        .await
        .expect("get_info failed")
        .expect("item should exist");

    assert_eq!(info.uid, "doc-1");
    assert_eq!(info.parent_uid.as_deref(), Some("folder-1"));
    assert_eq!(info.name, "joe.txt");
    assert_eq!(info.digest_algorithm.as_deref(), Some("md5"));
    assert_eq!(info.parent_path(), "/top/folder-1");
}

#[tokio::test]
async fn test_get_info_null_means_missing() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(&server, "NuxeoDrive.GetFileSystemItem", 200, serde_json::Value::Null)
        .await;

    assert_eq!(remote.get_info("gone").await.unwrap(), None);
}

#[tokio::test]
async fn test_get_info_404_means_missing() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(
        &server,
        "NuxeoDrive.GetFileSystemItem",
        404,
        serde_json::json!({"message": "not found"}),
    )
    .await;

    assert_eq!(remote.get_info("gone").await.unwrap(), None);
}

#[tokio::test]
async fn test_exists() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(&server, "NuxeoDrive.FileSystemItemExists", 200, serde_json::json!(true))
        .await;

    assert!(remote.exists("doc-1").await.unwrap());
}

#[tokio::test]
async fn test_get_children_bare_array() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(
        &server,
        "NuxeoDrive.GetChildren",
        200,
        serde_json::json!([
            common::folder_item("f-1", "root", "Test folder"),
            common::file_item("d-1", "root", "joe.txt"),
        ]),
    )
    .await;

    let children = remote.get_children("root").await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children[0].folderish);
    assert!(!children[1].folderish);
}

#[tokio::test]
async fn test_get_children_follows_pages() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.GetChildren"))
        .and(body_partial_json(serde_json::json!({"params": {"currentPageIndex": 0}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "entries": [common::file_item("d-1", "root", "a.txt")],
            "isNextPageAvailable": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.GetChildren"))
        .and(body_partial_json(serde_json::json!({"params": {"currentPageIndex": 1}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "entries": [common::file_item("d-2", "root", "b.txt")],
            "isNextPageAvailable": false
        })))
        .mount(&server)
        .await;

    let children = remote.get_children("root").await.unwrap();
    let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn test_scroll_descendants() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.ScrollDescendants"))
        .and(body_partial_json(serde_json::json!({
            "params": {"id": "root", "batchSize": 100}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "scrollId": "scroll-1",
            "fileSystemItems": [common::file_item("d-1", "root", "a.txt")]
        })))
        .mount(&server)
        .await;

    let batch = remote.scroll_descendants("root", None, 100).await.unwrap();
    assert_eq!(batch.scroll_id.as_deref(), Some("scroll-1"));
    assert_eq!(batch.file_system_items.len(), 1);
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_make_folder_sends_params() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.CreateFolder"))
        .and(body_partial_json(serde_json::json!({
            "params": {"parentId": "root", "name": "Test folder"}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::folder_item("f-9", "root", "Test folder")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let info = remote.make_folder("root", "Test folder").await.unwrap();
    assert_eq!(info.uid, "f-9");
    assert!(info.folderish);
    assert!(info.can_create_child);
}

#[tokio::test]
async fn test_move_uses_src_and_dest() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.Move"))
        .and(body_partial_json(serde_json::json!({
            "params": {"srcId": "d-1", "destId": "f-2"}
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::file_item("d-1", "f-2", "joe.txt")),
        )
        .mount(&server)
        .await;

    let info = remote.move_to("d-1", "f-2").await.unwrap();
    assert_eq!(info.parent_uid.as_deref(), Some("f-2"));
}

#[tokio::test]
async fn test_lock_targets_document_uid() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/Document.Lock"))
        .and(body_partial_json(serde_json::json!({"params": {"document": "doc:abc"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    remote
        .lock("defaultFileSystemItemFactory#default#abc")
        .await
        .expect("lock failed");
}

#[tokio::test]
async fn test_permissions_of_unreadable_item() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(&server, "NuxeoDrive.GetFileSystemItem", 200, serde_json::Value::Null)
        .await;

    let permissions = remote.permissions("secret").await.unwrap();
    assert!(!permissions.can_read);
    assert!(!permissions.can_update);
}

// ============================================================================
// Status mapping and retries
// ============================================================================

#[tokio::test]
async fn test_status_mapping() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(&server, "NuxeoDrive.Rename", 401, serde_json::json!({})).await;
    common::mount_operation(
        &server,
        "NuxeoDrive.Delete",
        403,
        serde_json::json!({"message": "no write"}),
    )
    .await;
    common::mount_operation(&server, "NuxeoDrive.CreateFolder", 409, serde_json::json!({})).await;
    common::mount_operation(&server, "NuxeoDrive.GetChildren", 500, serde_json::json!({})).await;

    assert_eq!(
        remote.rename("d-1", "x").await.unwrap_err(),
        RemoteError::Unauthorized
    );
    assert!(matches!(
        remote.delete("d-1").await.unwrap_err(),
        RemoteError::Forbidden(msg) if msg.contains("no write")
    ));
    assert!(matches!(
        remote.make_folder("root", "x").await.unwrap_err(),
        RemoteError::Conflict(_)
    ));
    assert!(matches!(
        remote.get_children("root").await.unwrap_err(),
        RemoteError::ServerError { status: 500, .. }
    ));
}

#[tokio::test]
async fn test_throttled_request_is_retried() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.FileSystemItemExists"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    common::mount_operation(&server, "NuxeoDrive.FileSystemItemExists", 200, serde_json::json!(true))
        .await;

    assert!(remote.exists("doc-1").await.expect("retries should succeed"));
}

#[tokio::test]
async fn test_unavailable_gives_up_after_three_retries() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.FileSystemItemExists"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
        .expect(4)
        .mount(&server)
        .await;

    let err = remote.exists("doc-1").await.unwrap_err();
    assert!(matches!(err, RemoteError::ServerError { status: 503, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_exhausted_429_reports_retry_after() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.FileSystemItemExists"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .mount(&server)
        .await;

    let err = remote.exists("doc-1").await.unwrap_err();
    assert_eq!(err, RemoteError::TooManyRequests { retry_after: Some(0) });
}
