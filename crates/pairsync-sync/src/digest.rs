//! Streaming digests of local files

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::Context as Md5Context;
use pairsync_core::domain::{DigestAlgorithm, DocPair, UNACCESSIBLE_HASH};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

const BUFFER_SIZE: usize = 64 * 1024;

/// Incremental hasher for the algorithms the server announces
pub enum Hasher {
    Md5(Md5Context),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Hasher::Md5(Md5Context::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize(self) -> String {
        match self {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha256(hasher) => format!("{:x}", hasher.finalize()),
        }
    }
}

/// Hashes a file without loading it in memory
pub fn compute_digest(path: &Path, algorithm: DigestAlgorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let digest = hasher.finalize();
    trace!(path = %path.display(), algorithm = %algorithm, digest = %digest, "Digest computed");
    Ok(digest)
}

/// Hashes a file on the blocking pool
///
/// Unreadable files yield [`UNACCESSIBLE_HASH`] so the caller can retry
/// later instead of failing the pair.
pub async fn compute_digest_async(path: PathBuf, algorithm: DigestAlgorithm) -> String {
    let shown = path.display().to_string();
    match tokio::task::spawn_blocking(move || compute_digest(&path, algorithm)).await {
        Ok(Ok(digest)) => digest,
        Ok(Err(e)) => {
            debug!(path = %shown, error = %e, "Cannot compute digest");
            UNACCESSIBLE_HASH.to_string()
        }
        Err(e) => {
            debug!(path = %shown, error = %e, "Digest task failed");
            UNACCESSIBLE_HASH.to_string()
        }
    }
}

/// Algorithm to hash the local side of `pair` with
///
/// Follows the remote digest when it is verifiable, md5 otherwise.
pub fn algorithm_for(pair: &DocPair) -> DigestAlgorithm {
    pair.digest_kind()
        .and_then(|kind| kind.algorithm())
        .unwrap_or(DigestAlgorithm::Md5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hasher_known_values() {
        let mut md5 = Hasher::new(DigestAlgorithm::Md5);
        md5.update(b"Some ");
        md5.update(b"content");
        assert_eq!(md5.finalize(), "b53227da4280f0e18270f21dd77c91d0");

        let mut sha = Hasher::new(DigestAlgorithm::Sha256);
        sha.update(b"Some content");
        assert_eq!(
            sha.finalize(),
            "9c6609fc5111405ea3f5bb3d1f6b5a5efd19a0cec53d85893fd96d265439cd5b"
        );
    }

    #[test]
    fn test_compute_digest_of_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            compute_digest(&path, DigestAlgorithm::Md5).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_algorithm_follows_remote_digest() {
        let mut pair = DocPair::default();
        assert_eq!(algorithm_for(&pair), DigestAlgorithm::Md5);
        pair.remote_digest = Some("9c6609fc5111405ea3f5bb3d1f6b5a5efd19a0cec53d85893fd96d265439cd5b".into());
        assert_eq!(algorithm_for(&pair), DigestAlgorithm::Sha256);
        pair.digest_algorithm = Some("sha1".into());
        assert_eq!(algorithm_for(&pair), DigestAlgorithm::Md5);
    }

    #[tokio::test]
    async fn test_unreadable_file_yields_sentinel() {
        let dir = TempDir::new().unwrap();
        let digest = compute_digest_async(dir.path().join("missing"), DigestAlgorithm::Md5).await;
        assert_eq!(digest, UNACCESSIBLE_HASH);
    }
}
