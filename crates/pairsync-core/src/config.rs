//! Configuration module for PairSync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.
//! Components receive the configuration as an immutable `Arc<Config>`; runtime
//! toggles live in [`FeatureFlags`](crate::features::FeatureFlags) instead.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for PairSync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub sync: SyncConfig,
    pub transfers: TransfersConfig,
    pub network: NetworkConfig,
    pub ignore: IgnoreConfig,
    pub features: FeaturesConfig,
    pub logging: LoggingConfig,
}

/// Process-wide locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Base directory for engine databases, bindings and logs.
    pub nxdrive_home: PathBuf,
}

/// What to do on the server when a synchronized item is deleted locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionBehavior {
    /// Delete the remote document as well.
    DeleteServer,
    /// Keep the remote document and filter it out locally.
    #[default]
    Unsync,
}

/// Synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between remote change-log polls.
    pub delay: u64,
    pub deletion_behavior: DeletionBehavior,
    /// Failures after which a pair is moved to `unsynchronized`.
    pub max_errors: u32,
    /// Size of the processor pool.
    pub max_file_processors: u32,
    /// Seconds a local event must settle before it is handled.
    pub debounce_secs: u64,
    /// Unlock read-only entries around mutations and re-lock them after.
    pub handle_readonly: bool,
    /// Permanently delete when moving to the trash fails.
    pub trash_fallback_delete: bool,
}

/// Upload and download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransfersConfig {
    /// Bytes per upload chunk.
    pub chunk_size: u64,
    /// Files strictly larger than this are uploaded in chunks.
    pub chunk_limit: u64,
    /// Downloads larger than this stream with progress and pause
    /// checkpoints; smaller ones are read in one piece (0 = always stream).
    pub tmp_file_limit: u64,
    /// Skip post-download digest verification.
    pub disabled_file_integrity_check: bool,
    /// Lower bound, in seconds, of the finalize transaction timeout.
    pub upload_transaction_timeout: u64,
}

/// HTTP and polling timings, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Per-request timeout of the synchronization traffic.
    pub timeout: u64,
    /// Timeout of the credential exchange when binding a server.
    pub handshake_timeout: u64,
    /// Interval between refreshes of the server-published options (0 = never).
    pub update_check_delay: u64,
}

/// Filename ignore rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    pub prefixes: Vec<String>,
    pub suffixes: Vec<String>,
}

/// Initial values of the runtime feature toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub direct_edit: bool,
    pub direct_transfer: bool,
    pub s3: bool,
    pub auto_update: bool,
    pub synchronization: bool,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `pretty` or `json`.
    pub format: String,
    /// Also write logs to `<nxdrive_home>/logs/pairsync.log`.
    pub file: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            nxdrive_home: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pairsync"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            delay: 30,
            deletion_behavior: DeletionBehavior::Unsync,
            max_errors: 3,
            max_file_processors: 5,
            debounce_secs: 2,
            handle_readonly: true,
            trash_fallback_delete: false,
        }
    }
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            chunk_limit: 1024 * 1024,
            tmp_file_limit: 0,
            disabled_file_integrity_check: false,
            upload_transaction_timeout: 300,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            handshake_timeout: 60,
            update_check_delay: 3600,
        }
    }
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            prefixes: [".", "desktop.ini", "icon\r", "thumbs.db", "~$"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            suffixes: [
                ".bak",
                ".crdownload",
                ".dwl",
                ".dwl2",
                ".lnk",
                ".lock",
                ".nxpart",
                ".part",
                ".partial",
                ".swp",
                ".tmp",
                "~",
                ".sb-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            direct_edit: true,
            direct_transfer: true,
            s3: false,
            auto_update: false,
            synchronization: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and saving
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the configuration as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/pairsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("pairsync")
            .join("config.yaml")
    }

    /// Directory holding one database per bound engine.
    pub fn engines_dir(&self) -> PathBuf {
        self.general.nxdrive_home.join("engines")
    }

    /// Directory holding log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.general.nxdrive_home.join("logs")
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.delay"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Smallest accepted upload chunk.
const MIN_CHUNK_SIZE: u64 = 1024;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut positive = |field: &str, value: u64| {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        };

        positive("sync.delay", self.sync.delay);
        positive("sync.max_errors", u64::from(self.sync.max_errors));
        positive("sync.max_file_processors", u64::from(self.sync.max_file_processors));
        positive("network.timeout", self.network.timeout);
        positive("network.handshake_timeout", self.network.handshake_timeout);
        positive(
            "transfers.upload_transaction_timeout",
            self.transfers.upload_transaction_timeout,
        );

        if self.transfers.chunk_size < MIN_CHUNK_SIZE {
            errors.push(ValidationError {
                field: "transfers.chunk_size".into(),
                message: format!("must be at least {MIN_CHUNK_SIZE} bytes"),
            });
        }

        if self.general.nxdrive_home.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "general.nxdrive_home".into(),
                message: "must not be empty".into(),
            });
        }

        if self.ignore.prefixes.iter().any(String::is_empty)
            || self.ignore.suffixes.iter().any(String::is_empty)
        {
            errors.push(ValidationError {
                field: "ignore".into(),
                message: "patterns must not be empty strings".into(),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}', expected one of: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use pairsync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .nxdrive_home(PathBuf::from("/tmp/pairsync"))
///     .delay(5)
///     .chunk_size(1024 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn nxdrive_home(mut self, home: PathBuf) -> Self {
        self.config.general.nxdrive_home = home;
        self
    }

    pub fn delay(mut self, seconds: u64) -> Self {
        self.config.sync.delay = seconds;
        self
    }

    pub fn deletion_behavior(mut self, behavior: DeletionBehavior) -> Self {
        self.config.sync.deletion_behavior = behavior;
        self
    }

    pub fn max_errors(mut self, n: u32) -> Self {
        self.config.sync.max_errors = n;
        self
    }

    pub fn max_file_processors(mut self, n: u32) -> Self {
        self.config.sync.max_file_processors = n;
        self
    }

    pub fn debounce_secs(mut self, seconds: u64) -> Self {
        self.config.sync.debounce_secs = seconds;
        self
    }

    pub fn trash_fallback_delete(mut self, enabled: bool) -> Self {
        self.config.sync.trash_fallback_delete = enabled;
        self
    }

    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.config.transfers.chunk_size = bytes;
        self
    }

    pub fn chunk_limit(mut self, bytes: u64) -> Self {
        self.config.transfers.chunk_limit = bytes;
        self
    }

    pub fn tmp_file_limit(mut self, bytes: u64) -> Self {
        self.config.transfers.tmp_file_limit = bytes;
        self
    }

    pub fn disabled_file_integrity_check(mut self, disabled: bool) -> Self {
        self.config.transfers.disabled_file_integrity_check = disabled;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.config.network.timeout = seconds;
        self
    }

    pub fn ignored_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.config.ignore.prefixes = prefixes;
        self
    }

    pub fn ignored_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.config.ignore.suffixes = suffixes;
        self
    }

    pub fn synchronization(mut self, enabled: bool) -> Self {
        self.config.features.synchronization = enabled;
        self
    }

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.delay, 30);
        assert_eq!(cfg.sync.max_errors, 3);
        assert_eq!(cfg.sync.max_file_processors, 5);
        assert_eq!(cfg.sync.debounce_secs, 2);
        assert_eq!(cfg.sync.deletion_behavior, DeletionBehavior::Unsync);
        assert_eq!(cfg.transfers.chunk_size, 1024 * 1024);
        assert_eq!(cfg.network.timeout, 30);
        assert_eq!(cfg.network.handshake_timeout, 60);
        assert_eq!(cfg.network.update_check_delay, 3600);
        assert!(cfg.ignore.prefixes.contains(&"~$".to_string()));
        assert!(cfg.ignore.suffixes.contains(&".swp".to_string()));
        assert!(cfg.features.synchronization);
        assert!(!cfg.features.s3);
        assert!(cfg.general.nxdrive_home.ends_with(".pairsync"));
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    #[test]
    fn zero_update_check_delay_is_valid() {
        let mut cfg = Config::default();
        cfg.network.update_check_delay = 0;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_partial_yaml_keeps_defaults() {
        let yaml = r#"
general:
  nxdrive_home: /tmp/pairsync-test
sync:
  delay: 10
  deletion_behavior: delete_server
transfers:
  chunk_size: 2097152
features:
  s3: true
logging:
  level: debug
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.general.nxdrive_home, PathBuf::from("/tmp/pairsync-test"));
        assert_eq!(cfg.sync.delay, 10);
        assert_eq!(cfg.sync.deletion_behavior, DeletionBehavior::DeleteServer);
        assert_eq!(cfg.sync.max_errors, 3);
        assert_eq!(cfg.transfers.chunk_size, 2 * 1024 * 1024);
        assert_eq!(cfg.transfers.chunk_limit, 1024 * 1024);
        assert!(cfg.features.s3);
        assert!(cfg.features.synchronization);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.engines_dir(), PathBuf::from("/tmp/pairsync-test/engines"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let cfg = ConfigBuilder::new().delay(7).max_errors(5).build();
        cfg.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), cfg);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.delay, 30);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn validate_catches_zero_timings() {
        let mut cfg = Config::default();
        cfg.sync.delay = 0;
        cfg.network.timeout = 0;
        cfg.sync.max_errors = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "sync.delay"));
        assert!(errors.iter().any(|e| e.field == "network.timeout"));
        assert!(errors.iter().any(|e| e.field == "sync.max_errors"));
    }

    #[test]
    fn validate_catches_tiny_chunks() {
        let result = ConfigBuilder::new().chunk_size(10).build_validated();
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| e.field == "transfers.chunk_size"));
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let result = ConfigBuilder::new().logging_level("verbose").build_validated();
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "logging.level");
        assert!(errors[0].to_string().contains("verbose"));
    }
}
