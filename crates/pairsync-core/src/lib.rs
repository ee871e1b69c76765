//! PairSync Core - Domain logic and reconciliation rules
//!
//! This crate contains the hexagonal core of the synchronization client:
//! - **Domain entities** - `DocPair`, `Filter`, `Transfer`, `Session`
//! - **State derivation** - `(LocalState, RemoteState)` to `PairState`
//! - **Port definitions** - `IPairStateStore`, `IRemoteClient`, `IQueueSink`
//! - **Configuration** - YAML `Config` and the runtime `FeatureFlags` store
//!
//! # Architecture
//!
//! The domain module is pure: it has no I/O and no async code. Ports define
//! the trait interfaces implemented by the adapter crates
//! (`pairsync-store`, `pairsync-remote`) and consumed by `pairsync-sync`.

pub mod config;
pub mod domain;
pub mod features;
pub mod ports;
