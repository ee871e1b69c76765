//! Local path client
//!
//! Every mutation under the sync root goes through [`LocalClient`]. Paths
//! handed in and out are root-relative pair paths (`/Test folder/joe.txt`,
//! `/` for the root itself); [`LocalClient::abspath`] and
//! [`LocalClient::get_path`] convert to and from absolute paths.
//!
//! The client
//! - names new entries with [`safe_filename`] (NFC, forbidden characters
//!   replaced),
//! - tags entries with their remote reference in an extended attribute,
//! - lifts the read-only flag of the entries it touches and restores it,
//! - refuses to overwrite an existing distinct entry
//!   ([`LocalError::DuplicationDisabled`]),
//! - sends deletions to the trash, deleting permanently only when
//!   `trash_fallback_delete` is set.
//!
//! Operations are blocking; async callers wrap long ones in
//! `spawn_blocking`.

pub mod error;
pub mod ignore;
pub mod names;
pub mod xattr;

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use pairsync_core::config::Config;
use pairsync_core::domain::{abspath, DigestAlgorithm, LocalInfo, UNACCESSIBLE_HASH};
use tracing::{debug, info, warn};

pub use error::LocalError;
pub use ignore::{is_temp_file, IgnoreRules};
pub use names::{normalize, safe_filename};
pub use xattr::{Xattrs, XATTR_REMOTE_REF, XATTR_ROOT_ID};

use error::IoResultExt;

use crate::digest::compute_digest;

/// Name of the scratch file used to test case sensitivity
const CASE_TEST_FILE: &str = ".pairsync-case-test";

/// Filesystem access scoped to one sync root
#[derive(Debug)]
pub struct LocalClient {
    root: PathBuf,
    ignore: IgnoreRules,
    xattrs: Xattrs,
    handle_readonly: bool,
    trash_fallback_delete: bool,
    case_sensitive: OnceLock<bool>,
}

impl LocalClient {
    /// Creates a client for `root`
    ///
    /// `sidecar` is the attribute file used when the filesystem has no
    /// native user attributes.
    pub fn new(root: impl Into<PathBuf>, config: &Config, sidecar: Option<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore: IgnoreRules::from_config(&config.ignore),
            xattrs: Xattrs::new(sidecar),
            handle_readonly: config.sync.handle_readonly,
            trash_fallback_delete: config.sync.trash_fallback_delete,
            case_sensitive: OnceLock::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abspath(&self, rel: &Path) -> PathBuf {
        abspath(&self.root, rel)
    }

    /// Converts an absolute path into a pair path, `None` outside the root
    pub fn get_path(&self, abs: &Path) -> Option<PathBuf> {
        let stripped = abs.strip_prefix(&self.root).ok()?;
        let mut rel = PathBuf::from("/");
        for component in stripped.components() {
            match component {
                Component::Normal(part) => rel.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(rel)
    }

    pub fn exists(&self, rel: &Path) -> bool {
        fs::symlink_metadata(self.abspath(rel)).is_ok()
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub fn get_info(&self, rel: &Path) -> Result<LocalInfo, LocalError> {
        let abs = self.abspath(rel);
        let meta = fs::metadata(&abs).at(&abs)?;
        let last_modification_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let creation_time = meta.created().ok().map(DateTime::<Utc>::from);
        let remote_ref = self.lookup_remote_ref(rel).unwrap_or_else(|e| {
            debug!(path = %rel.display(), error = %e, "Cannot read remote reference");
            None
        });

        Ok(LocalInfo {
            root: self.root.clone(),
            path: rel.to_path_buf(),
            folderish: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            last_modification_time,
            creation_time,
            remote_ref,
        })
    }

    /// Like [`get_info`](Self::get_info) but a missing path is `None`
    pub fn try_get_info(&self, rel: &Path) -> Result<Option<LocalInfo>, LocalError> {
        match self.get_info(rel) {
            Ok(info) => Ok(Some(info)),
            Err(LocalError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Children of a folder, ignored names excluded, sorted by name
    pub fn get_children_info(&self, rel: &Path) -> Result<Vec<LocalInfo>, LocalError> {
        let abs = self.abspath(rel);
        let mut children = Vec::new();
        for entry in fs::read_dir(&abs).at(&abs)? {
            let entry = entry.at(&abs)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.ignore.is_ignored(&name) {
                continue;
            }
            let file_type = entry.file_type().at(&entry.path())?;
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "Skipping symbolic link");
                continue;
            }
            match self.try_get_info(&rel.join(&name))? {
                Some(info) => children.push(info),
                None => continue,
            }
        }
        children.sort_by_key(|info| info.name());
        Ok(children)
    }

    /// Returns true if the entry or any of its ancestors is ignored
    pub fn is_ignored(&self, rel: &Path) -> bool {
        rel.components().any(|component| match component {
            Component::Normal(part) => self.ignore.is_ignored(&part.to_string_lossy()),
            _ => false,
        })
    }

    pub fn is_ignored_name(&self, name: &str) -> bool {
        self.ignore.is_ignored(name)
    }

    /// Tests whether the sync root distinguishes names by case
    ///
    /// The first conclusive test is cached.
    pub fn is_case_sensitive(&self) -> bool {
        if let Some(sensitive) = self.case_sensitive.get() {
            return *sensitive;
        }
        let scratch = self.root.join(CASE_TEST_FILE);
        if fs::write(&scratch, b"").is_err() {
            return true;
        }
        let sensitive = !self.root.join(CASE_TEST_FILE.to_uppercase()).exists();
        let _ = fs::remove_file(&scratch);
        *self.case_sensitive.get_or_init(|| sensitive)
    }

    /// Sets the case sensitivity instead of testing it; ignored once a value is known
    pub fn assume_case_sensitive(&self, sensitive: bool) -> bool {
        self.case_sensitive.set(sensitive).is_ok()
    }

    /// Name of an entry of `parent` equal to `name` except for case
    ///
    /// Always `None` on a case-sensitive root.
    pub fn case_twin(&self, parent: &Path, name: &str) -> Result<Option<String>, LocalError> {
        if self.is_case_sensitive() {
            return Ok(None);
        }
        let abs = self.abspath(parent);
        let exact = safe_filename(name);
        let wanted = exact.to_lowercase();
        for entry in fs::read_dir(&abs).at(&abs)? {
            let entry = entry.at(&abs)?;
            let existing = entry.file_name().to_string_lossy().into_owned();
            if existing != exact && existing.to_lowercase() == wanted {
                return Ok(Some(existing));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Creates a folder named after `name` under `parent`
    pub fn make_folder(&self, parent: &Path, name: &str) -> Result<PathBuf, LocalError> {
        let rel = parent.join(safe_filename(name));
        let abs = self.abspath(&rel);
        if abs.exists() {
            return Err(LocalError::DuplicationDisabled(abs));
        }
        self.with_unlocked(&[self.abspath(parent)], || fs::create_dir(&abs).at(&abs))?;
        debug!(path = %rel.display(), "Local folder created");
        Ok(rel)
    }

    /// Reserves the pair path of a new file named after `name` under `parent`
    ///
    /// Nothing is written; the caller renames a downloaded file into place.
    pub fn get_new_file(&self, parent: &Path, name: &str) -> Result<(PathBuf, PathBuf), LocalError> {
        let rel = parent.join(safe_filename(name));
        let abs = self.abspath(&rel);
        if abs.exists() {
            return Err(LocalError::DuplicationDisabled(abs));
        }
        Ok((rel, abs))
    }

    // ------------------------------------------------------------------
    // Renames and moves
    // ------------------------------------------------------------------

    /// Renames an entry in place
    pub fn rename(&self, rel: &Path, new_name: &str) -> Result<LocalInfo, LocalError> {
        let parent = parent_of(rel);
        let new_name = safe_filename(new_name);
        let old_name = file_name(rel);
        let target_rel = parent.join(&new_name);
        let source = self.abspath(rel);
        let target = self.abspath(&target_rel);
        if old_name == new_name {
            return self.get_info(rel);
        }

        let case_only = old_name.to_lowercase() == new_name.to_lowercase();
        let parent_abs = self.abspath(&parent);
        self.with_unlocked(&[parent_abs, source.clone()], || {
            if case_only && !self.is_case_sensitive() {
                let tmp = self.abspath(&parent.join(format!(".{new_name}.pairsync-rename")));
                fs::rename(&source, &tmp).at(&source)?;
                fs::rename(&tmp, &target).at(&target)
            } else {
                if target.exists() {
                    return Err(LocalError::DuplicationDisabled(target.clone()));
                }
                fs::rename(&source, &target).at(&source)
            }
        })?;

        info!(from = %rel.display(), to = %target_rel.display(), "Local entry renamed");
        self.get_info(&target_rel)
    }

    /// Moves an entry under `new_parent`, optionally renaming it
    pub fn move_to(
        &self,
        rel: &Path,
        new_parent: &Path,
        name: Option<&str>,
    ) -> Result<LocalInfo, LocalError> {
        let name = safe_filename(name.unwrap_or(&file_name(rel)));
        let target_rel = new_parent.join(&name);
        let source = self.abspath(rel);
        let target = self.abspath(&target_rel);
        if target.exists() {
            return Err(LocalError::DuplicationDisabled(target));
        }

        let unlock = [
            self.abspath(&parent_of(rel)),
            self.abspath(new_parent),
            source.clone(),
        ];
        self.with_unlocked(&unlock, || fs::rename(&source, &target).at(&source))?;

        info!(from = %rel.display(), to = %target_rel.display(), "Local entry moved");
        self.get_info(&target_rel)
    }

    /// Atomically replaces `dest` with the finished temporary file `tmp`
    pub fn rename_into(&self, tmp: &Path, dest: &Path) -> Result<(), LocalError> {
        let target = self.abspath(dest);
        let mut unlock = vec![self.abspath(&parent_of(dest))];
        if target.exists() {
            unlock.push(target.clone());
        }
        self.with_unlocked(&unlock, || fs::rename(tmp, &target).at(&target))
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Sends an entry to the trash
    pub fn delete(&self, rel: &Path) -> Result<(), LocalError> {
        let abs = self.abspath(rel);
        if !abs.exists() {
            return Ok(());
        }
        let result = self.with_unlocked(&[self.abspath(&parent_of(rel)), abs.clone()], || {
            trash::delete(&abs).map_err(|e| LocalError::TrashRefused {
                path: abs.clone(),
                message: e.to_string(),
            })
        });
        match result {
            Ok(()) => {
                info!(path = %rel.display(), "Local entry moved to trash");
                Ok(())
            }
            Err(LocalError::TrashRefused { path, message }) if self.trash_fallback_delete => {
                warn!(path = %path.display(), error = %message, "Trash refused, deleting permanently");
                self.delete_final(rel)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes an entry permanently
    pub fn delete_final(&self, rel: &Path) -> Result<(), LocalError> {
        let abs = self.abspath(rel);
        let meta = match fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LocalError::from_io(&abs, e)),
        };
        self.with_unlocked(&[self.abspath(&parent_of(rel))], || {
            if meta.is_dir() {
                unlock_tree(&abs);
                fs::remove_dir_all(&abs).at(&abs)
            } else {
                let _ = set_writable(&abs, true);
                fs::remove_file(&abs).at(&abs)
            }
        })?;
        info!(path = %rel.display(), "Local entry deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Extended attributes
    // ------------------------------------------------------------------

    pub fn lookup_remote_ref(&self, rel: &Path) -> Result<Option<String>, LocalError> {
        self.xattrs.get(&self.abspath(rel), XATTR_REMOTE_REF)
    }

    pub fn set_remote_ref(&self, rel: &Path, remote_ref: &str) -> Result<(), LocalError> {
        let abs = self.abspath(rel);
        self.with_unlocked(&[abs.clone()], || {
            self.xattrs.set(&abs, XATTR_REMOTE_REF, remote_ref)
        })
    }

    pub fn remove_remote_ref(&self, rel: &Path) -> Result<(), LocalError> {
        let abs = self.abspath(rel);
        self.with_unlocked(&[abs.clone()], || self.xattrs.remove(&abs, XATTR_REMOTE_REF))
    }

    pub fn get_root_id(&self) -> Result<Option<String>, LocalError> {
        self.xattrs.get(&self.root, XATTR_ROOT_ID)
    }

    pub fn set_root_id(&self, value: &str) -> Result<(), LocalError> {
        self.xattrs.set(&self.root, XATTR_ROOT_ID, value)
    }

    /// Strips every attribute set by the client below the root
    pub fn clean_xattrs(&self, rel: &Path) -> Result<usize, LocalError> {
        let abs = self.abspath(rel);
        let mut cleaned = 0;
        if self.lookup_remote_ref(rel)?.is_some() {
            self.remove_remote_ref(rel)?;
            cleaned += 1;
        }
        if rel == Path::new("/") {
            self.xattrs.remove(&abs, XATTR_ROOT_ID)?;
        }
        if abs.is_dir() {
            for entry in fs::read_dir(&abs).at(&abs)? {
                let entry = entry.at(&abs)?;
                if entry.file_type().at(&entry.path())?.is_symlink() {
                    continue;
                }
                cleaned += self.clean_xattrs(&rel.join(entry.file_name()))?;
            }
        }
        Ok(cleaned)
    }

    // ------------------------------------------------------------------
    // Read-only flags and times
    // ------------------------------------------------------------------

    pub fn set_readonly(&self, rel: &Path) -> Result<(), LocalError> {
        if !self.handle_readonly {
            return Ok(());
        }
        let abs = self.abspath(rel);
        set_writable(&abs, false).at(&abs)
    }

    pub fn unset_readonly(&self, rel: &Path) -> Result<(), LocalError> {
        let abs = self.abspath(rel);
        set_writable(&abs, true).at(&abs)
    }

    /// Applies the remote modification time to a local entry
    ///
    /// The creation time cannot be set on this platform and is ignored.
    pub fn change_file_date(
        &self,
        rel: &Path,
        mtime: Option<DateTime<Utc>>,
        _ctime: Option<DateTime<Utc>>,
    ) -> Result<(), LocalError> {
        let Some(mtime) = mtime else {
            return Ok(());
        };
        let abs = self.abspath(rel);
        let file = fs::File::open(&abs).at(&abs)?;
        file.set_modified(mtime.into()).at(&abs)
    }

    // ------------------------------------------------------------------
    // Digests and names
    // ------------------------------------------------------------------

    /// Digest of a local file, [`UNACCESSIBLE_HASH`] when it cannot be read
    pub fn get_digest(&self, rel: &Path, algorithm: DigestAlgorithm) -> String {
        let abs = self.abspath(rel);
        compute_digest(&abs, algorithm).unwrap_or_else(|e| {
            debug!(path = %abs.display(), error = %e, "Cannot compute digest");
            UNACCESSIBLE_HASH.to_string()
        })
    }

    /// Compares a local file against a remote digest
    ///
    /// The algorithm is guessed from the remote digest; the local digest is
    /// recomputed only when the cached one does not already match.
    pub fn is_equal_digests(
        &self,
        local_digest: Option<&str>,
        remote_digest: Option<&str>,
        rel: &Path,
    ) -> bool {
        let Some(remote) = remote_digest else {
            return false;
        };
        if local_digest.is_some_and(|local| local.eq_ignore_ascii_case(remote)) {
            return true;
        }
        match DigestAlgorithm::guess(remote) {
            Some(algorithm) => self.get_digest(rel, algorithm).eq_ignore_ascii_case(remote),
            None => false,
        }
    }

    /// Renames an entry whose name is not in canonical form
    ///
    /// Returns the new pair path when a rename happened.
    pub fn normalize(&self, rel: &Path) -> Result<Option<PathBuf>, LocalError> {
        let name = file_name(rel);
        if names::is_normalized(&name) {
            return Ok(None);
        }
        let info = self.rename(rel, &normalize(&name))?;
        debug!(from = %rel.display(), to = %info.path.display(), "Name normalized");
        Ok(Some(info.path))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Runs `op` with the read-only flag of `paths` lifted, then restores it
    fn with_unlocked<T>(
        &self,
        paths: &[PathBuf],
        op: impl FnOnce() -> Result<T, LocalError>,
    ) -> Result<T, LocalError> {
        let mut relocked = Vec::new();
        for path in paths {
            let readonly = fs::metadata(path)
                .map(|m| m.permissions().readonly())
                .unwrap_or(false);
            if readonly && set_writable(path, true).is_ok() {
                relocked.push(path.clone());
            }
        }

        let result = op();

        for path in relocked {
            // The entry may have been moved or deleted by `op`
            if path.exists() {
                if let Err(e) = set_writable(&path, false) {
                    warn!(path = %path.display(), error = %e, "Cannot restore read-only flag");
                }
            }
        }
        result
    }
}

fn parent_of(rel: &Path) -> PathBuf {
    rel.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"))
}

fn file_name(rel: &Path) -> String {
    rel.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn set_writable(abs: &Path, writable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(abs)?.permissions();
    let mode = perms.mode();
    perms.set_mode(if writable { mode | 0o200 } else { mode & !0o222 });
    fs::set_permissions(abs, perms)
}

#[cfg(not(unix))]
fn set_writable(abs: &Path, writable: bool) -> io::Result<()> {
    let mut perms = fs::metadata(abs)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(!writable);
    fs::set_permissions(abs, perms)
}

/// Makes a whole tree writable so it can be removed
fn unlock_tree(abs: &Path) {
    let _ = set_writable(abs, true);
    if let Ok(entries) = fs::read_dir(abs) {
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                unlock_tree(&path);
            } else {
                let _ = set_writable(&path, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairsync_core::config::ConfigBuilder;
    use tempfile::TempDir;

    fn client(dir: &TempDir) -> LocalClient {
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let config = ConfigBuilder::new().trash_fallback_delete(true).build();
        LocalClient::new(root, &config, Some(dir.path().join("xattrs.json")))
    }

    #[test]
    fn test_get_path_and_abspath() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let abs = local.root().join("Test folder").join("joe.txt");
        assert_eq!(local.get_path(&abs), Some(PathBuf::from("/Test folder/joe.txt")));
        assert_eq!(local.get_path(local.root()), Some(PathBuf::from("/")));
        assert_eq!(local.get_path(Path::new("/elsewhere")), None);
        assert_eq!(local.abspath(Path::new("/Test folder/joe.txt")), abs);
    }

    #[test]
    fn test_make_folder_refuses_duplicates() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let rel = local.make_folder(Path::new("/"), "Test folder").unwrap();
        assert_eq!(rel, PathBuf::from("/Test folder"));
        assert!(local.get_info(&rel).unwrap().folderish);

        let err = local.make_folder(Path::new("/"), "Test folder").unwrap_err();
        assert!(matches!(err, LocalError::DuplicationDisabled(_)));
    }

    #[test]
    fn test_make_folder_uses_safe_name() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let rel = local.make_folder(Path::new("/"), "a:b").unwrap();
        assert_eq!(rel, PathBuf::from("/a-b"));
    }

    #[test]
    fn test_children_skip_ignored_entries() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        fs::write(local.root().join("joe.txt"), b"Some content").unwrap();
        fs::write(local.root().join(".hidden"), b"x").unwrap();
        fs::write(local.root().join("movie.part"), b"x").unwrap();
        fs::create_dir(local.root().join("Test folder")).unwrap();

        let names: Vec<String> = local
            .get_children_info(Path::new("/"))
            .unwrap()
            .iter()
            .map(LocalInfo::name)
            .collect();
        assert_eq!(names, vec!["Test folder".to_string(), "joe.txt".to_string()]);
    }

    #[test]
    fn test_ignore_is_inherited() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        assert!(local.is_ignored(Path::new("/.git/config")));
        assert!(!local.is_ignored(Path::new("/Test folder/joe.txt")));
    }

    #[test]
    fn test_rename_and_move_keep_remote_ref() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let folder = local.make_folder(Path::new("/"), "Test folder").unwrap();
        let other = local.make_folder(Path::new("/"), "Other").unwrap();
        fs::write(local.abspath(&folder.join("joe.txt")), b"Some content").unwrap();
        local.set_remote_ref(&folder.join("joe.txt"), "doc-1").unwrap();

        let renamed = local.rename(&folder.join("joe.txt"), "jack.txt").unwrap();
        assert_eq!(renamed.path, PathBuf::from("/Test folder/jack.txt"));
        assert_eq!(renamed.remote_ref.as_deref(), Some("doc-1"));

        let moved = local.move_to(&renamed.path, &other, None).unwrap();
        assert_eq!(moved.path, PathBuf::from("/Other/jack.txt"));
        assert_eq!(moved.remote_ref.as_deref(), Some("doc-1"));
    }

    #[test]
    fn test_move_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        fs::write(local.root().join("a.txt"), b"a").unwrap();
        fs::create_dir(local.root().join("sub")).unwrap();
        fs::write(local.root().join("sub").join("a.txt"), b"b").unwrap();

        let err = local
            .move_to(Path::new("/a.txt"), Path::new("/sub"), None)
            .unwrap_err();
        assert!(matches!(err, LocalError::DuplicationDisabled(_)));
        assert_eq!(fs::read(local.root().join("sub").join("a.txt")).unwrap(), b"b");
    }

    #[test]
    fn test_readonly_entries_can_still_be_renamed() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let folder = local.make_folder(Path::new("/"), "Locked").unwrap();
        fs::write(local.abspath(&folder.join("joe.txt")), b"x").unwrap();
        local.set_readonly(&folder).unwrap();

        let renamed = local.rename(&folder.join("joe.txt"), "jack.txt").unwrap();
        assert_eq!(renamed.path, PathBuf::from("/Locked/jack.txt"));
        let perms = fs::metadata(local.abspath(&folder)).unwrap().permissions();
        assert!(perms.readonly());
        local.unset_readonly(&folder).unwrap();
    }

    #[test]
    fn test_delete_removes_entry() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let folder = local.make_folder(Path::new("/"), "Test folder").unwrap();
        fs::write(local.abspath(&folder.join("joe.txt")), b"x").unwrap();

        local.delete(&folder).unwrap();
        assert!(!local.exists(&folder));
        local.delete(&folder).unwrap();
    }

    #[test]
    fn test_digests() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        fs::write(local.root().join("joe.txt"), b"Some content").unwrap();
        let rel = Path::new("/joe.txt");

        let md5 = local.get_digest(rel, DigestAlgorithm::Md5);
        assert_eq!(md5, "b53227da4280f0e18270f21dd77c91d0");
        assert!(local.is_equal_digests(None, Some(&md5), rel));
        assert!(!local.is_equal_digests(None, Some("0123"), rel));
        assert_eq!(
            local.get_digest(Path::new("/missing"), DigestAlgorithm::Md5),
            UNACCESSIBLE_HASH
        );
    }

    #[test]
    fn test_normalize_renames_decomposed_names() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let decomposed = "e\u{301}te\u{301}.txt";
        fs::write(local.root().join(decomposed), b"x").unwrap();

        let renamed = local.normalize(&Path::new("/").join(decomposed)).unwrap();
        assert_eq!(renamed, Some(PathBuf::from("/\u{e9}t\u{e9}.txt")));
        assert_eq!(local.normalize(&renamed.unwrap()).unwrap(), None);
    }

    #[test]
    fn test_clean_xattrs() {
        let dir = TempDir::new().unwrap();
        let local = client(&dir);
        let folder = local.make_folder(Path::new("/"), "Test folder").unwrap();
        fs::write(local.abspath(&folder.join("joe.txt")), b"x").unwrap();
        local.set_remote_ref(&folder, "folder-1").unwrap();
        local.set_remote_ref(&folder.join("joe.txt"), "doc-1").unwrap();
        local.set_root_id("https://server|user|uid|root").unwrap();

        assert_eq!(local.clean_xattrs(Path::new("/")).unwrap(), 2);
        assert_eq!(local.lookup_remote_ref(&folder).unwrap(), None);
        assert_eq!(local.get_root_id().unwrap(), None);
    }
}
