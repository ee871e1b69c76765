//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set. Otherwise the level comes from the command
//! line flags, then from `logging.level` in the configuration file.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE: &str = "pairsync.log";

/// Console log encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_config(value: &str) -> Self {
        match value {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    /// Directory receiving `pairsync.log`, when file logging is on
    pub directory: Option<PathBuf>,
}

/// Picks the log level from the flags, falling back to the configuration
pub fn resolve_level(verbose: u8, quiet: bool, flag: Option<&str>, configured: &str) -> String {
    if let Some(level) = flag {
        return level.to_string();
    }
    if quiet {
        return "error".to_string();
    }
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn directives(level: &str) -> String {
    // sqlx logs every statement at info
    format!("{level},sqlx=warn")
}

pub fn init(settings: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(&settings.level)));

    let console = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let file = match &settings.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(handle))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install the tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_overrides_everything() {
        assert_eq!(resolve_level(2, true, Some("warn"), "info"), "warn");
    }

    #[test]
    fn test_quiet_and_verbosity() {
        assert_eq!(resolve_level(0, true, None, "info"), "error");
        assert_eq!(resolve_level(1, false, None, "info"), "debug");
        assert_eq!(resolve_level(3, false, None, "info"), "trace");
    }

    #[test]
    fn test_configured_level_is_the_default() {
        assert_eq!(resolve_level(0, false, None, "warn"), "warn");
    }

    #[test]
    fn test_format_from_config() {
        assert_eq!(LogFormat::from_config("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_config("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_config("other"), LogFormat::Pretty);
    }
}
