//! Batch upload operations
//!
//! Uploads go through server-side batches, which act as resumable
//! sessions:
//! - [`create_batch`] - `POST /api/v1/upload/` opens a batch
//! - [`upload_chunk`] - `POST /api/v1/upload/{batch}/0` sends one chunk
//! - [`batch_info`] - `GET /api/v1/upload/{batch}/0` lists received chunks
//! - [`cancel_batch`] - `DELETE /api/v1/upload/{batch}` drops the batch
//! - [`create_file`] / [`update_content`] - run a finalize operation on
//!   the batch blob
//!
//! Chunk indexes start at 0. A batch unknown to the server answers 404,
//! which callers treat as "expired, start over".

use reqwest::Method;
use serde_json::json;
use tracing::{debug, info};

use pairsync_core::domain::RemoteInfo;
use pairsync_core::ports::{BatchState, RemoteError};

use crate::client::{decode_json, RemoteClient, TX_TIMEOUT_HEADER};
use crate::wire::{FsItem, WireBatch, WireBatchFile};

const UPLOAD_PATH: &str = "/api/v1/upload";

/// Opens a new upload batch
pub async fn create_batch(client: &RemoteClient) -> Result<String, RemoteError> {
    let path = format!("{}/", UPLOAD_PATH);
    let response = client
        .execute_with_retry("upload/create", || client.request(Method::POST, &path))
        .await?;
    let batch: WireBatch = decode_json("upload/create", response).await?;
    debug!(batch_id = %batch.batch_id, "Upload batch created");
    Ok(batch.batch_id)
}

/// Reads the state of the first file of a batch
///
/// Returns `None` when the server no longer knows the batch.
pub async fn batch_info(client: &RemoteClient, batch_id: &str) -> Result<Option<BatchState>, RemoteError> {
    let path = format!("{}/{}/0", UPLOAD_PATH, batch_id);
    let response = match client
        .execute_with_retry("upload/info", || client.request(Method::GET, &path))
        .await
    {
        Ok(response) => response,
        Err(RemoteError::NotFound(_)) => {
            debug!(batch_id, "Upload batch is unknown to the server");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    // A batch that exists but has received nothing answers 204
    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(Some(BatchState {
            batch_id: batch_id.to_string(),
            uploaded_chunk_ids: Vec::new(),
            chunk_count: None,
        }));
    }

    let file: WireBatchFile = decode_json("upload/info", response).await?;
    Ok(Some(BatchState {
        batch_id: batch_id.to_string(),
        uploaded_chunk_ids: file.uploaded_chunk_ids,
        chunk_count: file.chunk_count,
    }))
}

/// Sends chunk `index` (0-based) of `count`
///
/// # Errors
///
/// Returns `RemoteError::BatchExpired` if the server answers 404.
pub async fn upload_chunk(
    client: &RemoteClient,
    batch_id: &str,
    index: u32,
    count: u32,
    data: Vec<u8>,
    filename: &str,
    filesize: u64,
) -> Result<(), RemoteError> {
    let path = format!("{}/{}/0", UPLOAD_PATH, batch_id);
    let length = data.len();
    let encoded_name = url::form_urlencoded::byte_serialize(filename.as_bytes()).collect::<String>();

    let result = client
        .execute_with_retry("upload/chunk", || {
            client
                .request(Method::POST, &path)
                .header("X-Upload-Type", "chunked")
                .header("X-Upload-Chunk-Index", index.to_string())
                .header("X-Upload-Chunk-Count", count.to_string())
                .header("X-File-Name", encoded_name.as_str())
                .header("X-File-Size", filesize.to_string())
                .header("Content-Type", "application/octet-stream")
                .body(data.clone())
        })
        .await;

    match result {
        Ok(_) => {
            debug!(batch_id, index, count, bytes = length, "Chunk uploaded");
            Ok(())
        }
        Err(RemoteError::NotFound(_)) => Err(RemoteError::BatchExpired(batch_id.to_string())),
        Err(e) => Err(e),
    }
}

/// Drops a batch and its uploaded chunks
pub async fn cancel_batch(client: &RemoteClient, batch_id: &str) -> Result<(), RemoteError> {
    let path = format!("{}/{}", UPLOAD_PATH, batch_id);
    match client
        .execute_with_retry("upload/cancel", || client.request(Method::DELETE, &path))
        .await
    {
        Ok(_) | Err(RemoteError::NotFound(_)) => {
            debug!(batch_id, "Upload batch cancelled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Runs a finalize operation against the blob of a batch
async fn execute_on_batch(
    client: &RemoteClient,
    operation: &str,
    batch_id: &str,
    params: serde_json::Value,
    transaction_timeout: u64,
) -> Result<RemoteInfo, RemoteError> {
    let path = format!("{}/{}/0/execute/{}", UPLOAD_PATH, batch_id, operation);
    let body = json!({ "params": params });
    let response = client
        .execute_with_retry(operation, || {
            client
                .request(Method::POST, &path)
                .header(TX_TIMEOUT_HEADER, transaction_timeout.to_string())
                .json(&body)
        })
        .await?;
    let item: FsItem = decode_json(operation, response).await?;
    Ok(item.into())
}

/// Creates a file document under `parent_ref` from the batch blob
pub async fn create_file(
    client: &RemoteClient,
    parent_ref: &str,
    name: &str,
    batch_id: &str,
    transaction_timeout: u64,
) -> Result<RemoteInfo, RemoteError> {
    let info = execute_on_batch(
        client,
        "NuxeoDrive.CreateFile",
        batch_id,
        json!({ "parentId": parent_ref, "name": name, "overwrite": false }),
        transaction_timeout,
    )
    .await?;
    info!(parent_ref, name, uid = %info.uid, "Remote file created");
    Ok(info)
}

/// Replaces the blob of `remote_ref` with the batch blob
pub async fn update_content(
    client: &RemoteClient,
    remote_ref: &str,
    batch_id: &str,
    transaction_timeout: u64,
) -> Result<RemoteInfo, RemoteError> {
    let info = execute_on_batch(
        client,
        "NuxeoDrive.UpdateFile",
        batch_id,
        json!({ "id": remote_ref }),
        transaction_timeout,
    )
    .await?;
    info!(remote_ref, "Remote file content updated");
    Ok(info)
}
