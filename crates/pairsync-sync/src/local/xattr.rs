//! Extended attributes on synchronized entries
//!
//! Every tracked entry carries the reference of its remote document in
//! `user.pairsync.remote_ref`; the sync root carries its binding in
//! `user.pairsync.root_id`. Attributes travel with the inode, so they
//! survive renames and moves, which is what the local watcher relies on to
//! tell a move from a creation.
//!
//! Filesystems without user attributes (some network and FAT mounts) fall
//! back to a JSON sidecar keyed by `(device, inode)`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::error::{IoResultExt, LocalError};

/// Attribute holding the remote document reference
pub const XATTR_REMOTE_REF: &str = "user.pairsync.remote_ref";

/// Attribute holding the binding of the sync root
pub const XATTR_ROOT_ID: &str = "user.pairsync.root_id";

/// Extended attribute access with a sidecar fallback
#[derive(Debug)]
pub struct Xattrs {
    sidecar: Option<SidecarStore>,
}

impl Xattrs {
    /// Creates an accessor; without `sidecar_path` unsupported filesystems
    /// surface an error instead of falling back
    pub fn new(sidecar_path: Option<PathBuf>) -> Self {
        Self {
            sidecar: sidecar_path.map(SidecarStore::open),
        }
    }

    pub fn get(&self, path: &Path, name: &str) -> Result<Option<String>, LocalError> {
        match native::get(path, name) {
            Ok(value) => Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if is_unsupported(&err) => match &self.sidecar {
                Some(sidecar) => sidecar.get(path, name),
                None => Ok(None),
            },
            Err(err) => Err(LocalError::from_io(path, err)),
        }
    }

    pub fn set(&self, path: &Path, name: &str, value: &str) -> Result<(), LocalError> {
        match native::set(path, name, value.as_bytes()) {
            Ok(()) => Ok(()),
            Err(err) if is_unsupported(&err) => match &self.sidecar {
                Some(sidecar) => sidecar.set(path, name, value),
                None => Err(LocalError::from_io(path, err)),
            },
            Err(err) => Err(LocalError::from_io(path, err)),
        }
    }

    /// Removes an attribute; removing a missing attribute is not an error
    pub fn remove(&self, path: &Path, name: &str) -> Result<(), LocalError> {
        match native::remove(path, name) {
            Ok(()) => Ok(()),
            Err(err) if is_unsupported(&err) => match &self.sidecar {
                Some(sidecar) => sidecar.remove(path, name),
                None => Ok(()),
            },
            Err(err) => Err(LocalError::from_io(path, err)),
        }
    }
}

fn is_unsupported(err: &io::Error) -> bool {
    errno_unsupported(err) || err.kind() == io::ErrorKind::Unsupported
}

#[cfg(unix)]
fn errno_unsupported(err: &io::Error) -> bool {
    // Same value on Linux, distinct on the BSDs
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOTSUP || code == libc::EOPNOTSUPP)
}

#[cfg(not(unix))]
fn errno_unsupported(_err: &io::Error) -> bool {
    false
}

#[cfg(target_os = "linux")]
mod native {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn c_strings(path: &Path, name: &str) -> io::Result<(CString, CString)> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let c_name =
            CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok((c_path, c_name))
    }

    pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        let (c_path, c_name) = c_strings(path, name)?;
        let mut buf = vec![0u8; 256];
        loop {
            // SAFETY: both strings are NUL-terminated and `buf` is valid for `buf.len()` bytes
            let ret = unsafe {
                libc::getxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if ret >= 0 {
                buf.truncate(ret as usize);
                return Ok(Some(buf));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENODATA) => return Ok(None),
                Some(libc::ERANGE) => {
                    // SAFETY: a null buffer of size 0 only queries the value size
                    let size = unsafe {
                        libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
                    };
                    if size < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    buf.resize(size as usize, 0);
                }
                _ => return Err(err),
            }
        }
    }

    pub fn set(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        let (c_path, c_name) = c_strings(path, name)?;
        // SAFETY: both strings are NUL-terminated and `value` is valid for its length
        let ret = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr().cast::<libc::c_void>(),
                value.len(),
                0,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn remove(path: &Path, name: &str) -> io::Result<()> {
        let (c_path, c_name) = c_strings(path, name)?;
        // SAFETY: both strings are NUL-terminated
        let ret = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod native {
    use std::io;
    use std::path::Path;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "native extended attributes unavailable")
    }

    pub fn get(_path: &Path, _name: &str) -> io::Result<Option<Vec<u8>>> {
        Err(unsupported())
    }

    pub fn set(_path: &Path, _name: &str, _value: &[u8]) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn remove(_path: &Path, _name: &str) -> io::Result<()> {
        Err(unsupported())
    }
}

// ============================================================================
// Sidecar fallback
// ============================================================================

type Entries = HashMap<String, HashMap<String, String>>;

#[cfg(unix)]
fn inode_key(_path: &Path, meta: &fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{}:{}", meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn inode_key(path: &Path, _meta: &fs::Metadata) -> String {
    path.to_string_lossy().into_owned()
}

/// JSON file mapping inode keys to attribute maps
#[derive(Debug)]
pub struct SidecarStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl SidecarStore {
    /// Loads the sidecar file, starting empty if it is missing or unreadable
    pub fn open(path: PathBuf) -> Self {
        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Discarding unreadable xattr sidecar");
                Entries::new()
            }),
            Err(_) => Entries::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn key(path: &Path) -> Result<String, LocalError> {
        let meta = fs::metadata(path).at(path)?;
        Ok(inode_key(path, &meta))
    }

    pub fn get(&self, path: &Path, name: &str) -> Result<Option<String>, LocalError> {
        let key = Self::key(path)?;
        let entries = self.lock();
        Ok(entries.get(&key).and_then(|attrs| attrs.get(name)).cloned())
    }

    pub fn set(&self, path: &Path, name: &str, value: &str) -> Result<(), LocalError> {
        let key = Self::key(path)?;
        let mut entries = self.lock();
        entries
            .entry(key)
            .or_default()
            .insert(name.to_string(), value.to_string());
        self.persist(&entries)
    }

    pub fn remove(&self, path: &Path, name: &str) -> Result<(), LocalError> {
        let key = Self::key(path)?;
        let mut entries = self.lock();
        let Some(attrs) = entries.get_mut(&key) else {
            return Ok(());
        };
        attrs.remove(name);
        if attrs.is_empty() {
            entries.remove(&key);
        }
        self.persist(&entries)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, entries: &Entries) -> Result<(), LocalError> {
        let raw = serde_json::to_vec_pretty(entries).map_err(|e| LocalError::Io {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw).at(&tmp)?;
        fs::rename(&tmp, &self.path).at(&self.path)?;
        debug!(path = %self.path.display(), entries = entries.len(), "Xattr sidecar saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_unsupported_errno_is_recognized() {
        assert!(is_unsupported(&io::Error::from_raw_os_error(libc::ENOTSUP)));
        assert!(is_unsupported(&io::Error::from_raw_os_error(libc::EOPNOTSUPP)));
        assert!(!is_unsupported(&io::Error::from_raw_os_error(libc::EACCES)));
    }

    #[test]
    fn test_sidecar_round_trip_follows_inode() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("joe.txt");
        fs::write(&file, b"Some content").unwrap();
        let sidecar = SidecarStore::open(dir.path().join("xattrs.json"));

        assert_eq!(sidecar.get(&file, XATTR_REMOTE_REF).unwrap(), None);
        sidecar.set(&file, XATTR_REMOTE_REF, "doc-1").unwrap();

        let renamed = dir.path().join("renamed.txt");
        fs::rename(&file, &renamed).unwrap();
        assert_eq!(
            sidecar.get(&renamed, XATTR_REMOTE_REF).unwrap().as_deref(),
            Some("doc-1")
        );

        sidecar.remove(&renamed, XATTR_REMOTE_REF).unwrap();
        assert_eq!(sidecar.get(&renamed, XATTR_REMOTE_REF).unwrap(), None);
    }

    #[test]
    fn test_sidecar_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("folder");
        fs::create_dir(&file).unwrap();
        let path = dir.path().join("xattrs.json");

        SidecarStore::open(path.clone())
            .set(&file, XATTR_ROOT_ID, "root")
            .unwrap();
        let reopened = SidecarStore::open(path);
        assert_eq!(reopened.get(&file, XATTR_ROOT_ID).unwrap().as_deref(), Some("root"));
    }

    #[test]
    fn test_xattrs_get_set_remove() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("joe.txt");
        fs::write(&file, b"x").unwrap();
        let xattrs = Xattrs::new(Some(dir.path().join("xattrs.json")));

        xattrs.set(&file, XATTR_REMOTE_REF, "doc-1").unwrap();
        assert_eq!(xattrs.get(&file, XATTR_REMOTE_REF).unwrap().as_deref(), Some("doc-1"));
        xattrs.remove(&file, XATTR_REMOTE_REF).unwrap();
        assert_eq!(xattrs.get(&file, XATTR_REMOTE_REF).unwrap(), None);
        xattrs.remove(&file, XATTR_REMOTE_REF).unwrap();
    }
}
