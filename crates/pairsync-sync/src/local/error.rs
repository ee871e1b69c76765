//! Path client errors

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{ErrorKind, LocalFailure};

/// Errors raised by [`LocalClient`](super::LocalClient) operations
#[derive(Debug, Error)]
pub enum LocalError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Read-only path: {0}")]
    ReadOnly(PathBuf),

    /// Another process holds the file
    #[error("File locked: {0}")]
    Locked(PathBuf),

    #[error("No space left on device while writing {0}")]
    NoSpace(PathBuf),

    #[error("Path too long: {0}")]
    PathTooLong(PathBuf),

    #[error("Cannot move {0} across filesystems")]
    CrossDevice(PathBuf),

    #[error("Trash refused {path}: {message}")]
    TrashRefused { path: PathBuf, message: String },

    /// The target name is already taken by another entry
    #[error("Duplication disabled: {0} already exists")]
    DuplicationDisabled(PathBuf),

    #[error("Path outside of the sync root: {0}")]
    OutsideRoot(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LocalError {
    /// Maps an OS error on `path` to the matching variant
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.raw_os_error() {
            Some(libc::ENOENT) => return LocalError::NotFound(path),
            Some(libc::EROFS | libc::EACCES | libc::EPERM) => return LocalError::ReadOnly(path),
            Some(libc::EBUSY | libc::ETXTBSY) => return LocalError::Locked(path),
            Some(libc::ENOSPC | libc::EDQUOT) => return LocalError::NoSpace(path),
            Some(libc::ENAMETOOLONG) => return LocalError::PathTooLong(path),
            Some(libc::EXDEV) => return LocalError::CrossDevice(path),
            Some(libc::EEXIST | libc::ENOTEMPTY) => return LocalError::DuplicationDisabled(path),
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::NotFound => LocalError::NotFound(path),
            io::ErrorKind::PermissionDenied => LocalError::ReadOnly(path),
            io::ErrorKind::AlreadyExists => LocalError::DuplicationDisabled(path),
            _ => LocalError::Io { path, source: err },
        }
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        let failure = match self {
            LocalError::NotFound(_) => LocalFailure::NotFound,
            LocalError::ReadOnly(_) => LocalFailure::ReadOnly,
            LocalError::Locked(_) => LocalFailure::Locked,
            LocalError::NoSpace(_) => LocalFailure::NoSpace,
            LocalError::PathTooLong(_) => LocalFailure::PathTooLong,
            LocalError::CrossDevice(_) => LocalFailure::CrossDevice,
            LocalError::TrashRefused { .. } => LocalFailure::TrashRefused,
            LocalError::DuplicationDisabled(_) => return ErrorKind::Duplication,
            LocalError::OutsideRoot(_) => return ErrorKind::Invariant,
            LocalError::Io { .. } => LocalFailure::Other,
        };
        ErrorKind::LocalFilesystem(failure)
    }
}

/// Extension turning `io::Result` into `Result<_, LocalError>` for a path
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T, LocalError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, LocalError> {
        self.map_err(|err| LocalError::from_io(path, err))
    }
}
