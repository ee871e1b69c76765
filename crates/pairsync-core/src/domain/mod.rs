//! Domain entities and reconciliation rules
//!
//! - `DocPair` rows and their identifiers
//! - Side states and the pair-state derivation function
//! - Local and remote observations (`LocalInfo`, `RemoteInfo`)
//! - Filters, transfers and sessions
//! - Digest algorithm classification
//! - Domain-specific error types

pub mod digest;
pub mod doc_pair;
pub mod errors;
pub mod filter;
pub mod info;
pub mod states;
pub mod transfer;

pub use digest::{DigestAlgorithm, DigestKind, NOT_IN_BINARY_STORE, UNACCESSIBLE_HASH};
pub use doc_pair::{DocPair, PairId};
pub use errors::DomainError;
pub use filter::{is_filtered, Filter};
pub use info::{abspath, LocalInfo, RemoteInfo};
pub use states::{
    derive_pair_state, DerivationInput, DigestComparison, LocalState, PairState, RemoteState, Side,
};
pub use transfer::{chunk_count, Session, Transfer, TransferDirection, TransferStatus};
