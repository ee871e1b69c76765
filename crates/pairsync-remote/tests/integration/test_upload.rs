//! Integration tests for batch uploads and downloads

use pairsync_core::domain::RemoteInfo;
use pairsync_core::ports::{IDownloadStream, IRemoteClient, RemoteError};
use wiremock::matchers::{body_bytes, body_partial_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_create_batch() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({"batchId": "batch-1"})),
        )
        .mount(&server)
        .await;

    assert_eq!(remote.create_batch().await.unwrap(), "batch-1");
}

#[tokio::test]
async fn test_upload_chunk_headers() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/batch-1/0"))
        .and(header("X-Upload-Type", "chunked"))
        .and(header("X-Upload-Chunk-Index", "1"))
        .and(header("X-Upload-Chunk-Count", "3"))
        .and(header("X-File-Name", "my+file.txt"))
        .and(header("X-File-Size", "2500"))
        .and(body_bytes(b"chunk-two".to_vec()))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "uploaded": "true",
            "uploadedChunkIds": [0, 1]
        })))
        .expect(1)
        .mount(&server)
        .await;

    remote
        .upload_chunk("batch-1", 1, 3, b"chunk-two".to_vec(), "my file.txt", 2500)
        .await
        .expect("chunk upload failed");
}

#[tokio::test]
async fn test_upload_chunk_to_expired_batch() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/old-batch/0"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = remote
        .upload_chunk("old-batch", 0, 1, vec![1, 2, 3], "a.bin", 3)
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::BatchExpired("old-batch".to_string()));
}

#[tokio::test]
async fn test_batch_info_lists_uploaded_chunks() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/upload/batch-1/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "big.bin",
            "size": 3000,
            "uploadType": "chunked",
            "uploadedChunkIds": [0, 2],
            "chunkCount": 3
        })))
        .mount(&server)
        .await;

    let state = remote.batch_info("batch-1").await.unwrap().expect("batch exists");
    assert_eq!(state.batch_id, "batch-1");
    assert_eq!(state.uploaded_chunk_ids, vec![0, 2]);
    assert_eq!(state.chunk_count, Some(3));
}

#[tokio::test]
async fn test_batch_info_of_unknown_batch() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/upload/gone/0"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert_eq!(remote.batch_info("gone").await.unwrap(), None);
}

#[tokio::test]
async fn test_cancel_batch() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("DELETE"))
        .and(path("/api/v1/upload/batch-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    remote.cancel_batch("batch-1").await.expect("cancel failed");
}

#[tokio::test]
async fn test_create_file_sends_transaction_timeout() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/batch-1/0/execute/NuxeoDrive.CreateFile"))
        .and(header("Nuxeo-Transaction-Timeout", "300"))
        .and(body_partial_json(serde_json::json!({
            "params": {"parentId": "folder-1", "name": "joe.txt"}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item("doc-7", "folder-1", "joe.txt")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let info = remote
        .create_file("folder-1", "joe.txt", "batch-1", 300)
        .await
        .expect("create_file failed");
    assert_eq!(info.uid, "doc-7");
}

#[tokio::test]
async fn test_update_content() {
    let (server, remote) = common::setup_remote_mock().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/batch-2/0/execute/NuxeoDrive.UpdateFile"))
        .and(body_partial_json(serde_json::json!({"params": {"id": "doc-7"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item("doc-7", "folder-1", "joe.txt")),
        )
        .mount(&server)
        .await;

    let info = remote.update_content("doc-7", "batch-2", 600).await.unwrap();
    assert_eq!(info.uid, "doc-7");
}

// ============================================================================
// Downloads
// ============================================================================

#[tokio::test]
async fn test_download_streams_content() {
    let (server, remote) = common::setup_remote_mock().await;

    let content: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/nxfile/default/doc-1/blobholder:0/big.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content.clone())
                .append_header("Content-Type", "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let item: serde_json::Value = common::file_item("doc-1", "folder-1", "big.bin");
    let info: RemoteInfo = serde_json::from_value::<pairsync_remote::wire::FsItem>(item)
        .unwrap()
        .into();

    let mut stream = remote.download(&info).await.expect("download failed");
    assert_eq!(stream.content_length(), Some(200_000));

    let mut received = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, content);
}

#[tokio::test]
async fn test_download_of_folder_is_rejected() {
    let (_server, remote) = common::setup_remote_mock().await;

    let item = common::folder_item("f-1", "root", "Test folder");
    let info: RemoteInfo = serde_json::from_value::<pairsync_remote::wire::FsItem>(item)
        .unwrap()
        .into();

    assert!(matches!(
        remote.download(&info).await.err(),
        Some(RemoteError::InvalidResponse(_))
    ));
}
