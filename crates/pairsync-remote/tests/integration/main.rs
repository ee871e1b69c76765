//! Integration tests for pairsync-remote
//!
//! Uses wiremock to simulate the document repository and verifies the
//! HTTP encoding of item operations, change polling, batch uploads and
//! downloads, plus the status mapping and retry behavior.

mod common;

mod test_changes;
mod test_documents;
mod test_upload;
