//! Streamed downloads
//!
//! A download opens `GET {server}/{download_url}` and hands the body to
//! the caller as a pull stream, so the transfer engine decides when to
//! write, hash and check for pauses.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use reqwest::Method;
use tracing::debug;

use pairsync_core::domain::RemoteInfo;
use pairsync_core::ports::{IDownloadStream, RemoteError};

use crate::client::{map_transport_error, RemoteClient};

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, RemoteError>> + Send>>;

/// Body of an HTTP download
pub struct HttpDownloadStream {
    inner: ByteStream,
    content_length: Option<u64>,
}

#[async_trait::async_trait]
impl IDownloadStream for HttpDownloadStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        self.inner.next().await.transpose()
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

/// Opens the content stream of a file item
///
/// # Errors
///
/// Returns `RemoteError::InvalidResponse` for folders or items without a
/// download URL, and the mapped HTTP error if the server refuses.
pub async fn download(client: &RemoteClient, info: &RemoteInfo) -> Result<HttpDownloadStream, RemoteError> {
    let url = info.download_url.as_deref().ok_or_else(|| {
        RemoteError::InvalidResponse(format!("Item {} has no download URL", info.uid))
    })?;

    let response = client
        .execute_with_retry("download", || client.request(Method::GET, url))
        .await?;
    let content_length = response.content_length();
    debug!(uid = %info.uid, content_length, "Download started");

    let inner = response
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(map_transport_error))
        .boxed();

    Ok(HttpDownloadStream {
        inner,
        content_length,
    })
}
