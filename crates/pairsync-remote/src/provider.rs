//! RemoteProvider - IRemoteClient implementation over HTTP
//!
//! Wraps the [`RemoteClient`] and delegates to the documents, changes,
//! upload and download modules to fulfil the [`IRemoteClient`] port
//! contract.

use std::collections::HashMap;

use async_trait::async_trait;

use pairsync_core::domain::RemoteInfo;
use pairsync_core::ports::{
    BatchState, ChangeSummary, IDownloadStream, IRemoteClient, RemoteError, RemotePermissions,
    RemoteUser, ScrollBatch,
};

use crate::client::RemoteClient;
use crate::{changes, documents, download, upload};

/// Remote client port implementation backed by the HTTP API
pub struct RemoteProvider {
    client: RemoteClient,
}

impl RemoteProvider {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    /// Returns the underlying HTTP client
    pub fn client(&self) -> &RemoteClient {
        &self.client
    }
}

#[async_trait]
impl IRemoteClient for RemoteProvider {
    async fn fetch_user(&self) -> Result<RemoteUser, RemoteError> {
        changes::fetch_user(&self.client).await
    }

    async fn get_info(&self, remote_ref: &str) -> Result<Option<RemoteInfo>, RemoteError> {
        documents::get_info(&self.client, remote_ref).await
    }

    async fn exists(&self, remote_ref: &str) -> Result<bool, RemoteError> {
        documents::exists(&self.client, remote_ref).await
    }

    async fn get_children(&self, remote_ref: &str) -> Result<Vec<RemoteInfo>, RemoteError> {
        documents::get_children(&self.client, remote_ref).await
    }

    async fn scroll_descendants(
        &self,
        remote_ref: &str,
        scroll_id: Option<&str>,
        batch_size: u32,
    ) -> Result<ScrollBatch, RemoteError> {
        documents::scroll_descendants(&self.client, remote_ref, scroll_id, batch_size).await
    }

    async fn make_folder(&self, parent_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError> {
        documents::make_folder(&self.client, parent_ref, name).await
    }

    async fn rename(&self, remote_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError> {
        documents::rename(&self.client, remote_ref, name).await
    }

    async fn move_to(&self, remote_ref: &str, new_parent_ref: &str) -> Result<RemoteInfo, RemoteError> {
        documents::move_to(&self.client, remote_ref, new_parent_ref).await
    }

    async fn delete(&self, remote_ref: &str) -> Result<(), RemoteError> {
        documents::delete(&self.client, remote_ref).await
    }

    async fn download(&self, info: &RemoteInfo) -> Result<Box<dyn IDownloadStream>, RemoteError> {
        let stream = download::download(&self.client, info).await?;
        Ok(Box::new(stream))
    }

    async fn create_batch(&self) -> Result<String, RemoteError> {
        upload::create_batch(&self.client).await
    }

    async fn batch_info(&self, batch_id: &str) -> Result<Option<BatchState>, RemoteError> {
        upload::batch_info(&self.client, batch_id).await
    }

    async fn upload_chunk(
        &self,
        batch_id: &str,
        index: u32,
        count: u32,
        data: Vec<u8>,
        filename: &str,
        filesize: u64,
    ) -> Result<(), RemoteError> {
        upload::upload_chunk(&self.client, batch_id, index, count, data, filename, filesize).await
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<(), RemoteError> {
        upload::cancel_batch(&self.client, batch_id).await
    }

    async fn create_file(
        &self,
        parent_ref: &str,
        name: &str,
        batch_id: &str,
        transaction_timeout: u64,
    ) -> Result<RemoteInfo, RemoteError> {
        upload::create_file(&self.client, parent_ref, name, batch_id, transaction_timeout).await
    }

    async fn update_content(
        &self,
        remote_ref: &str,
        batch_id: &str,
        transaction_timeout: u64,
    ) -> Result<RemoteInfo, RemoteError> {
        upload::update_content(&self.client, remote_ref, batch_id, transaction_timeout).await
    }

    async fn get_changes(
        &self,
        last_event_log_id: i64,
        root_refs: &[String],
    ) -> Result<ChangeSummary, RemoteError> {
        changes::get_changes(&self.client, last_event_log_id, root_refs).await
    }

    async fn get_roots(&self) -> Result<Vec<RemoteInfo>, RemoteError> {
        changes::get_roots(&self.client).await
    }

    async fn register_as_root(&self, remote_ref: &str) -> Result<(), RemoteError> {
        changes::register_as_root(&self.client, remote_ref).await
    }

    async fn unregister_as_root(&self, remote_ref: &str) -> Result<(), RemoteError> {
        changes::unregister_as_root(&self.client, remote_ref).await
    }

    async fn permissions(&self, remote_ref: &str) -> Result<RemotePermissions, RemoteError> {
        documents::permissions(&self.client, remote_ref).await
    }

    async fn lock(&self, remote_ref: &str) -> Result<(), RemoteError> {
        documents::lock(&self.client, remote_ref).await
    }

    async fn unlock(&self, remote_ref: &str) -> Result<(), RemoteError> {
        documents::unlock(&self.client, remote_ref).await
    }

    async fn server_features(&self) -> Result<HashMap<String, bool>, RemoteError> {
        changes::server_features(&self.client).await
    }
}
