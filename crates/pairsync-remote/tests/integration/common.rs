//! Shared test helpers for remote client integration tests
//!
//! Provides a wiremock server and helpers to mount automation operations.
//! Each setup function returns a `RemoteProvider` pointing at the mock.

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pairsync_remote::client::{Credentials, RemoteClient};
use pairsync_remote::RemoteProvider;

pub const TEST_TOKEN: &str = "test-device-token";

/// Starts a mock server and a token-authenticated provider pointing at it
pub async fn setup_remote_mock() -> (MockServer, RemoteProvider) {
    let server = MockServer::start().await;
    let client = RemoteClient::new(server.uri(), Credentials::Token(TEST_TOKEN.to_string()));
    (server, RemoteProvider::new(client))
}

/// JSON of a file item as the server describes it
pub fn file_item(id: &str, parent_id: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "parentId": parent_id,
        "path": format!("/top/{}/{}", parent_id, id),
        "name": name,
        "folder": false,
        "lastModificationDate": 1_700_000_000_000_i64,
        "creationDate": 1_700_000_000_000_i64,
        "lastContributor": "joe",
        "digest": "5eb63bbbe01eeed093cb22bb8f5acdc3",
        "digestAlgorithm": "MD5",
        "downloadURL": format!("nxfile/default/{}/blobholder:0/{}", id, name),
        "canRename": true,
        "canUpdate": true,
        "canDelete": true,
        "canCreateChild": false,
        "lockInfo": null
    })
}

/// JSON of a folder item as the server describes it
pub fn folder_item(id: &str, parent_id: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "parentId": parent_id,
        "path": format!("/top/{}/{}", parent_id, id),
        "name": name,
        "folder": true,
        "lastModificationDate": 1_700_000_000_000_i64,
        "creationDate": 1_700_000_000_000_i64,
        "lastContributor": "joe",
        "canRename": true,
        "canDelete": true,
        "canCreateChild": true
    })
}

/// Mounts an automation operation answering `status` with a JSON body
pub async fn mount_operation(
    server: &MockServer,
    operation: &str,
    status: u16,
    body: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path(format!("/api/v1/automation/{}", operation)))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}
