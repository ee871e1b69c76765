//! Server bindings registry
//!
//! Each `bind-server` records an engine in `<nxdrive_home>/bindings.yaml`.
//! The device token is not kept here but in the engine database.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const BINDINGS_FILE: &str = "bindings.yaml";

/// One bound account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Engine uid, also the name of its database file
    pub uid: String,
    pub server_url: String,
    pub user: String,
    pub local_folder: PathBuf,
}

impl Binding {
    /// `<nxdrive_home>/engines/<uid>.db`
    pub fn database_path(&self, engines_dir: &Path) -> PathBuf {
        engines_dir.join(format!("{}.db", self.uid))
    }
}

/// All bindings of one `nxdrive_home`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bindings {
    #[serde(default)]
    pub engines: Vec<Binding>,
}

impl Bindings {
    pub fn path(home: &Path) -> PathBuf {
        home.join(BINDINGS_FILE)
    }

    /// Loads the registry, empty when the file does not exist yet
    pub fn load(home: &Path) -> Result<Self> {
        let path = Self::path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        std::fs::create_dir_all(home)
            .with_context(|| format!("Failed to create {}", home.display()))?;
        let path = Self::path(home);
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Finds the binding whose local folder is `folder`
    pub fn find(&self, folder: &Path) -> Option<&Binding> {
        let folder = normalize(folder);
        self.engines
            .iter()
            .find(|b| normalize(&b.local_folder) == folder)
    }

    /// Records a binding; a folder can only be bound once
    pub fn add(&mut self, binding: Binding) -> Result<()> {
        if let Some(existing) = self.find(&binding.local_folder) {
            anyhow::bail!(
                "{} is already bound to {} as {}",
                existing.local_folder.display(),
                existing.server_url,
                existing.user
            );
        }
        self.engines.push(binding);
        Ok(())
    }

    /// Removes and returns the binding of `folder`
    pub fn remove(&mut self, folder: &Path) -> Option<Binding> {
        let folder = normalize(folder);
        let index = self
            .engines
            .iter()
            .position(|b| normalize(&b.local_folder) == folder)?;
        Some(self.engines.remove(index))
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.components().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn binding(uid: &str, folder: &Path) -> Binding {
        Binding {
            uid: uid.to_string(),
            server_url: "https://docs.example.com/nuxeo".to_string(),
            user: "alice".to_string(),
            local_folder: folder.to_path_buf(),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let home = TempDir::new().unwrap();
        let bindings = Bindings::load(home.path()).unwrap();
        assert!(bindings.engines.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let home = TempDir::new().unwrap();
        let folder = home.path().join("Drive");
        let mut bindings = Bindings::default();
        bindings.add(binding("abc", &folder)).unwrap();
        bindings.save(home.path()).unwrap();

        let loaded = Bindings::load(home.path()).unwrap();
        assert_eq!(loaded, bindings);
        assert_eq!(loaded.find(&folder).unwrap().uid, "abc");
    }

    #[test]
    fn test_folder_bound_only_once() {
        let home = TempDir::new().unwrap();
        let folder = home.path().join("Drive");
        let mut bindings = Bindings::default();
        bindings.add(binding("abc", &folder)).unwrap();
        assert!(bindings.add(binding("def", &folder)).is_err());
        assert_eq!(bindings.engines.len(), 1);
    }

    #[test]
    fn test_find_ignores_trailing_separator() {
        let home = TempDir::new().unwrap();
        let folder = home.path().join("Drive");
        std::fs::create_dir(&folder).unwrap();
        let mut bindings = Bindings::default();
        bindings.add(binding("abc", &folder)).unwrap();

        let with_slash = PathBuf::from(format!("{}/", folder.display()));
        assert!(bindings.find(&with_slash).is_some());
    }

    #[test]
    fn test_remove() {
        let home = TempDir::new().unwrap();
        let folder = home.path().join("Drive");
        let mut bindings = Bindings::default();
        bindings.add(binding("abc", &folder)).unwrap();

        let removed = bindings.remove(&folder).unwrap();
        assert_eq!(removed.uid, "abc");
        assert!(bindings.remove(&folder).is_none());
    }

    #[test]
    fn test_database_path() {
        let b = binding("abc", Path::new("/data/Drive"));
        assert_eq!(
            b.database_path(Path::new("/home/u/.pairsync/engines")),
            PathBuf::from("/home/u/.pairsync/engines/abc.db")
        );
    }
}
