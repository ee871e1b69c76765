//! Change log and synchronization roots
//!
//! The server keeps an audit log of document events. Clients poll it with
//! the high-water mark of their previous poll (`lowerBound`) and the list
//! of roots they were following, and receive the changes since then plus
//! the current root list. The client configuration the server publishes
//! is fetched here too.

use std::collections::HashMap;

use reqwest::Method;
use serde_json::json;
use tracing::{debug, info, warn};

use pairsync_core::domain::RemoteInfo;
use pairsync_core::ports::{ChangeSummary, RemoteError, RemoteUser};

use crate::client::{decode_json, Credentials, RemoteClient};
use crate::documents::document_uid;
use crate::wire::{
    format_root_definitions, WireChangeSummary, WireDocuments, WireLogin, WireServerOptions,
};

/// Repository holding the synchronized documents
pub const REPOSITORY: &str = "default";

/// Polls the change log
///
/// # Arguments
/// * `last_event_log_id` - Upper bound returned by the previous poll (0 for none)
/// * `root_refs` - Roots active at the previous poll
pub async fn get_changes(
    client: &RemoteClient,
    last_event_log_id: i64,
    root_refs: &[String],
) -> Result<ChangeSummary, RemoteError> {
    let wire: WireChangeSummary = client
        .operation_json(
            "NuxeoDrive.GetChangeSummary",
            json!({
                "lowerBound": last_event_log_id,
                "lastSyncActiveRootDefinitions": format_root_definitions(REPOSITORY, root_refs),
            }),
        )
        .await?;

    let summary: ChangeSummary = wire.into();
    if summary.has_too_many_changes {
        warn!(
            lower_bound = last_event_log_id,
            "Server reported too many changes, a full scan is required"
        );
    }
    debug!(
        lower_bound = last_event_log_id,
        upper_bound = summary.upper_bound,
        changes = summary.file_system_changes.len(),
        "Change summary received"
    );
    Ok(summary)
}

/// Lists the sync roots registered for the user
pub async fn get_roots(client: &RemoteClient) -> Result<Vec<RemoteInfo>, RemoteError> {
    let docs: WireDocuments = client.operation_json("NuxeoDrive.GetRoots", json!({})).await?;
    Ok(docs.entries.into_iter().map(Into::into).collect())
}

async fn set_synchronization(client: &RemoteClient, remote_ref: &str, enable: bool) -> Result<(), RemoteError> {
    client
        .operation(
            "NuxeoDrive.SetSynchronization",
            json!({
                "document": format!("doc:{}", document_uid(remote_ref)),
                "enable": enable,
            }),
        )
        .await?;
    info!(remote_ref, enable, "Synchronization root updated");
    Ok(())
}

pub async fn register_as_root(client: &RemoteClient, remote_ref: &str) -> Result<(), RemoteError> {
    set_synchronization(client, remote_ref, true).await
}

pub async fn unregister_as_root(client: &RemoteClient, remote_ref: &str) -> Result<(), RemoteError> {
    set_synchronization(client, remote_ref, false).await
}

/// Authentication handshake
///
/// With basic credentials a device token is acquired first and returned in
/// [`RemoteUser::token`]; the identity is then confirmed with the `login`
/// operation using the same credentials.
pub async fn fetch_user(client: &RemoteClient) -> Result<RemoteUser, RemoteError> {
    let token = match client.credentials() {
        Credentials::Basic { .. } => Some(client.acquire_token().await?),
        Credentials::Token(token) => Some(token.clone()),
    };

    let login: WireLogin = client.operation_json("login", json!({})).await?;
    info!(username = %login.username, "Authenticated against the server");

    Ok(RemoteUser {
        username: login.username,
        token,
        server_time: None,
    })
}

/// Path of the client configuration published by the server
pub const SERVER_OPTIONS_PATH: &str = "/api/v1/drive/configuration";

/// Fetches the feature toggles of the client configuration
///
/// Servers without a published configuration answer 404, which yields no
/// toggles.
pub async fn server_features(client: &RemoteClient) -> Result<HashMap<String, bool>, RemoteError> {
    let response = match client
        .execute_with_retry(SERVER_OPTIONS_PATH, || {
            client.request(Method::GET, SERVER_OPTIONS_PATH)
        })
        .await
    {
        Ok(response) => response,
        Err(RemoteError::NotFound(_)) => {
            debug!("Server publishes no client configuration");
            return Ok(HashMap::new());
        }
        Err(e) => return Err(e),
    };
    let options: WireServerOptions = decode_json(SERVER_OPTIONS_PATH, response).await?;
    debug!(features = options.feature.len(), "Server configuration received");
    Ok(options.feature)
}
