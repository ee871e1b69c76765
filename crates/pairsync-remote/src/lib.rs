//! PairSync Remote - HTTP client for the document repository
//!
//! Provides an async client for:
//! - Authentication (basic credentials exchanged for a device token)
//! - File-system item operations through JSON automation calls
//! - Change-log polling and sync-root registration
//! - Resumable batch uploads and streamed downloads
//!
//! ## Modules
//!
//! - [`client`] - Authenticated HTTP client, retry loop and status mapping
//! - [`wire`] - Server JSON payloads and their conversion to domain types
//! - [`documents`] - Item lookups, listings and mutations
//! - [`changes`] - Change summary and sync roots
//! - [`upload`] - Batch upload endpoints
//! - [`download`] - Streamed blob downloads
//! - [`provider`] - `IRemoteClient` implementation

pub mod changes;
pub mod client;
pub mod documents;
pub mod download;
pub mod provider;
pub mod upload;
pub mod wire;

pub use client::{Credentials, RemoteClient};
pub use provider::RemoteProvider;
