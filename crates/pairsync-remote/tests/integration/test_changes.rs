//! Integration tests for change polling, sync roots and authentication

use pairsync_core::ports::{ChangeKind, IRemoteClient, RemoteError};
use pairsync_remote::client::{Credentials, RemoteClient};
use pairsync_remote::RemoteProvider;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_get_changes_sends_bounds_and_roots() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.GetChangeSummary"))
        .and(body_partial_json(serde_json::json!({
            "params": {
                "lowerBound": 41,
                "lastSyncActiveRootDefinitions": "default:root-1"
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "upperBound": 57,
            "activeSynchronizationRootDefinitions": "default:root-1,default:root-2",
            "syncDate": 1_700_000_100,
            "hasTooManyChanges": false,
            "fileSystemChanges": [{
                "repositoryId": "default",
                "eventId": "documentModified",
                "eventDate": 1_700_000_050,
                "docUuid": "doc-1",
                "fileSystemItemId": "doc-1",
                "fileSystemItemName": "joe.txt",
                "fileSystemItem": common::file_item("doc-1", "root-1", "joe.txt")
            }, {
                "repositoryId": "default",
                "eventId": "deleted",
                "eventDate": 1_700_000_060,
                "docUuid": "doc-2",
                "fileSystemItemId": "doc-2",
                "fileSystemItemName": "old.txt",
                "fileSystemItem": null
            }]
        })))
        .mount(&server)
        .await;

    let summary = remote
        .get_changes(41, &["root-1".to_string()])
        .await
        .expect("get_changes failed");

    assert_eq!(summary.upper_bound, 57);
    assert_eq!(summary.active_roots, vec!["root-1".to_string(), "root-2".to_string()]);
    assert!(!summary.has_too_many_changes);
    assert_eq!(summary.file_system_changes.len(), 2);
    assert_eq!(summary.file_system_changes[0].event_id, ChangeKind::Modified);
    assert_eq!(summary.file_system_changes[1].event_id, ChangeKind::Deleted);
    assert!(summary.file_system_changes[1].file_system_item.is_none());
}

#[tokio::test]
async fn test_get_changes_too_many() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(
        &server,
        "NuxeoDrive.GetChangeSummary",
        200,
        serde_json::json!({
            "upperBound": 900,
            "activeSynchronizationRootDefinitions": "default:root-1",
            "syncDate": 1_700_000_100,
            "hasTooManyChanges": true,
            "fileSystemChanges": []
        }),
    )
    .await;

    let summary = remote.get_changes(1, &[]).await.unwrap();
    assert!(summary.has_too_many_changes);
    assert_eq!(summary.upper_bound, 900);
}

#[tokio::test]
async fn test_get_roots() {
    let (server, remote) = common::setup_remote_mock().await;
    common::mount_operation(
        &server,
        "NuxeoDrive.GetRoots",
        200,
        serde_json::json!({
            "entity-type": "documents",
            "entries": [{
                "entity-type": "document",
                "uid": "root-1",
                "path": "/default-domain/workspaces/ws",
                "title": "ws",
                "lastModified": "2026-01-15T10:00:00Z"
            }]
        }),
    )
    .await;

    let roots = remote.get_roots().await.unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].uid, "root-1");
    assert_eq!(roots[0].name, "ws");
    assert!(roots[0].folderish);
}

#[tokio::test]
async fn test_register_and_unregister_root() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.SetSynchronization"))
        .and(body_partial_json(serde_json::json!({
            "params": {"document": "doc:root-1", "enable": true}
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/automation/NuxeoDrive.SetSynchronization"))
        .and(body_partial_json(serde_json::json!({
            "params": {"document": "doc:root-1", "enable": false}
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    remote.register_as_root("root-1").await.unwrap();
    remote.unregister_as_root("root-1").await.unwrap();
}

#[tokio::test]
async fn test_fetch_user_with_basic_credentials_acquires_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/authentication/token"))
        .and(header_exists("Authorization"))
        .and(query_param("applicationName", "PairSync"))
        .and(query_param("deviceId", "device-42"))
        .and(query_param("permission", "ReadWrite"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fresh-token\n"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/automation/login"))
        .and(header_exists("Authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "entity-type": "login",
            "username": "joe"
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::new(
        server.uri(),
        Credentials::Basic {
            username: "joe".to_string(),
            password: "secret".to_string(),
        },
    )
    .with_device_id("device-42");
    let remote = RemoteProvider::new(client);

    let user = remote.fetch_user().await.expect("handshake failed");
    assert_eq!(user.username, "joe");
    assert_eq!(user.token.as_deref(), Some("fresh-token"));
}

#[tokio::test]
async fn test_fetch_user_with_revoked_token() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/automation/login"))
        .and(header("X-Authentication-Token", common::TEST_TOKEN))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    assert_eq!(remote.fetch_user().await.unwrap_err(), RemoteError::Unauthorized);
}

#[tokio::test]
async fn test_server_features_are_read_from_configuration() {
    let (server, remote) = common::setup_remote_mock().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/configuration"))
        .and(header("X-Authentication-Token", common::TEST_TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "feature": {"auto_update": false, "direct_edit": true},
            "log_level_file": "DEBUG"
        })))
        .mount(&server)
        .await;

    let features = remote.server_features().await.unwrap();
    assert_eq!(features.len(), 2);
    assert_eq!(features.get("auto_update"), Some(&false));
    assert_eq!(features.get("direct_edit"), Some(&true));
}

#[tokio::test]
async fn test_server_without_configuration_has_no_features() {
    let (server, remote) = common::setup_remote_mock().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/configuration"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(remote.server_features().await.unwrap().is_empty());
}
