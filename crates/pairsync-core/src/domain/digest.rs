//! Digest algorithms announced by the server
//!
//! The server tags every blob with a digest and, usually, the algorithm
//! that produced it. Some storage backends compute digests asynchronously
//! and hand out opaque values instead (multipart ETags, for instance);
//! those are flagged `Exotic` and skip integrity verification. A bare
//! 40-hex digest is taken for SHA-1 and flagged `Unsupported`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Digest sentinel recorded when a local file cannot be read
pub const UNACCESSIBLE_HASH: &str = "TO_COMPUTE";

/// Digest value announced for blobs not yet in the binary store
pub const NOT_IN_BINARY_STORE: &str = "notInBinaryStore";

/// Algorithms the client can compute locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Returns the canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    /// Length of the hex encoding of a digest of this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 32,
            DigestAlgorithm::Sha256 => 64,
        }
    }

    /// Guesses the algorithm from the length of a hex digest
    pub fn guess(digest: &str) -> Option<Self> {
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match digest.len() {
            32 => Some(DigestAlgorithm::Md5),
            64 => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            other => Err(DomainError::ValidationFailed(format!(
                "unsupported digest algorithm: {other}"
            ))),
        }
    }
}

/// Classification of a remote digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestKind {
    /// Computable locally with the given algorithm
    Supported(DigestAlgorithm),
    /// Opaque or asynchronously computed; verification is skipped
    Exotic,
    /// Declared algorithm the client does not implement
    Unsupported(String),
}

impl DigestKind {
    /// Classifies a remote digest from its value and declared algorithm
    pub fn classify(digest: &str, algorithm: Option<&str>) -> Self {
        match algorithm {
            Some(name) if !name.is_empty() => match name.parse::<DigestAlgorithm>() {
                Ok(algo) => DigestKind::Supported(algo),
                Err(_) => DigestKind::Unsupported(name.to_string()),
            },
            _ => match DigestAlgorithm::guess(digest) {
                Some(algo) => DigestKind::Supported(algo),
                None if is_sha1_like(digest) => DigestKind::Unsupported("sha1".to_string()),
                None => DigestKind::Exotic,
            },
        }
    }

    /// Returns the algorithm when the digest can be verified locally
    pub fn algorithm(&self) -> Option<DigestAlgorithm> {
        match self {
            DigestKind::Supported(algo) => Some(*algo),
            _ => None,
        }
    }
}

/// 40 hex characters: a SHA-1, which the client cannot verify
fn is_sha1_like(digest: &str) -> bool {
    digest.len() == 40 && digest.chars().all(|c| c.is_ascii_hexdigit())
}
