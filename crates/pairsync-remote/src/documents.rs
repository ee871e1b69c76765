//! File-system item operations
//!
//! Lookups, listings and mutations of documents through the
//! `NuxeoDrive.*` automation operations. Every function returns domain
//! [`RemoteInfo`] values converted from the server's [`FsItem`] JSON.

use serde_json::json;
use tracing::{debug, info};

use pairsync_core::domain::RemoteInfo;
use pairsync_core::ports::{RemoteError, RemotePermissions, ScrollBatch};

use crate::client::RemoteClient;
use crate::wire::{ChildrenPage, FsItem, WireScroll};

/// Page size requested when the server pages children listings
const CHILDREN_PAGE_SIZE: u32 = 1000;

/// Fetches one item; `None` when it is missing or not readable
pub async fn get_info(client: &RemoteClient, remote_ref: &str) -> Result<Option<RemoteInfo>, RemoteError> {
    let item: Result<Option<FsItem>, RemoteError> = client
        .operation_optional("NuxeoDrive.GetFileSystemItem", json!({ "id": remote_ref }))
        .await;
    match item {
        Ok(item) => Ok(item.map(Into::into)),
        Err(RemoteError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Returns true if the item exists and is readable
pub async fn exists(client: &RemoteClient, remote_ref: &str) -> Result<bool, RemoteError> {
    let exists: Option<bool> = client
        .operation_optional("NuxeoDrive.FileSystemItemExists", json!({ "id": remote_ref }))
        .await?;
    Ok(exists.unwrap_or(false))
}

/// Lists the direct children of a folder, following pages if any
pub async fn get_children(client: &RemoteClient, remote_ref: &str) -> Result<Vec<RemoteInfo>, RemoteError> {
    let mut children = Vec::new();
    let mut page_index = 0u32;

    loop {
        let page: ChildrenPage = client
            .operation_json(
                "NuxeoDrive.GetChildren",
                json!({
                    "id": remote_ref,
                    "pageSize": CHILDREN_PAGE_SIZE,
                    "currentPageIndex": page_index,
                }),
            )
            .await?;

        match page {
            ChildrenPage::All(items) => {
                children.extend(items.into_iter().map(RemoteInfo::from));
                break;
            }
            ChildrenPage::Paged {
                entries,
                is_next_page_available,
            } => {
                let empty = entries.is_empty();
                children.extend(entries.into_iter().map(RemoteInfo::from));
                if !is_next_page_available || empty {
                    break;
                }
                page_index += 1;
            }
        }
    }

    debug!(remote_ref, count = children.len(), "Listed remote children");
    Ok(children)
}

/// Fetches one page of descendants; an empty page ends the scroll
pub async fn scroll_descendants(
    client: &RemoteClient,
    remote_ref: &str,
    scroll_id: Option<&str>,
    batch_size: u32,
) -> Result<ScrollBatch, RemoteError> {
    let scroll: WireScroll = client
        .operation_json(
            "NuxeoDrive.ScrollDescendants",
            json!({
                "id": remote_ref,
                "scrollId": scroll_id,
                "batchSize": batch_size,
            }),
        )
        .await?;
    Ok(scroll.into())
}

pub async fn make_folder(client: &RemoteClient, parent_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError> {
    let item: FsItem = client
        .operation_json(
            "NuxeoDrive.CreateFolder",
            json!({ "parentId": parent_ref, "name": name, "overwrite": false }),
        )
        .await?;
    info!(parent_ref, name, uid = %item.id, "Remote folder created");
    Ok(item.into())
}

pub async fn rename(client: &RemoteClient, remote_ref: &str, name: &str) -> Result<RemoteInfo, RemoteError> {
    let item: FsItem = client
        .operation_json("NuxeoDrive.Rename", json!({ "id": remote_ref, "name": name }))
        .await?;
    info!(remote_ref, name, "Remote item renamed");
    Ok(item.into())
}

pub async fn move_to(
    client: &RemoteClient,
    remote_ref: &str,
    new_parent_ref: &str,
) -> Result<RemoteInfo, RemoteError> {
    let item: FsItem = client
        .operation_json(
            "NuxeoDrive.Move",
            json!({ "srcId": remote_ref, "destId": new_parent_ref }),
        )
        .await?;
    info!(remote_ref, new_parent_ref, "Remote item moved");
    Ok(item.into())
}

/// Deletes (trashes) an item on the server
pub async fn delete(client: &RemoteClient, remote_ref: &str) -> Result<(), RemoteError> {
    client
        .operation("NuxeoDrive.Delete", json!({ "id": remote_ref }))
        .await?;
    info!(remote_ref, "Remote item deleted");
    Ok(())
}

/// Effective permissions, read from the item flags
///
/// An item the user cannot see yields all-false permissions.
pub async fn permissions(client: &RemoteClient, remote_ref: &str) -> Result<RemotePermissions, RemoteError> {
    Ok(match get_info(client, remote_ref).await? {
        Some(info) => RemotePermissions {
            can_read: true,
            can_update: info.can_update,
            can_rename: info.can_rename,
            can_delete: info.can_delete,
            can_create_child: info.can_create_child,
        },
        None => RemotePermissions {
            can_read: false,
            can_update: false,
            can_rename: false,
            can_delete: false,
            can_create_child: false,
        },
    })
}

/// Document id behind a file-system item id (`factory#repository#uid`)
pub fn document_uid(remote_ref: &str) -> &str {
    remote_ref.rsplit('#').next().unwrap_or(remote_ref)
}

pub async fn lock(client: &RemoteClient, remote_ref: &str) -> Result<(), RemoteError> {
    client
        .operation(
            "Document.Lock",
            json!({ "document": format!("doc:{}", document_uid(remote_ref)) }),
        )
        .await?;
    debug!(remote_ref, "Remote document locked");
    Ok(())
}

pub async fn unlock(client: &RemoteClient, remote_ref: &str) -> Result<(), RemoteError> {
    client
        .operation(
            "Document.Unlock",
            json!({ "document": format!("doc:{}", document_uid(remote_ref)) }),
        )
        .await?;
    debug!(remote_ref, "Remote document unlocked");
    Ok(())
}
