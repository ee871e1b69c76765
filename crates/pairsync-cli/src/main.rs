//! PairSync CLI - Command-line interface for PairSync
//!
//! Provides commands for:
//! - Binding local folders to server accounts
//! - Registering synchronization roots
//! - Running the engines in the foreground
//! - Viewing sync status and cleaning folders

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pairsync_core::config::Config;

mod bindings;
mod commands;
mod logging;
mod output;
mod session;

use commands::{
    bind_server::BindServerCommand,
    clean_folder::CleanFolderCommand,
    console::ConsoleCommand,
    roots::{BindRootCommand, UnbindRootCommand},
    status::StatusCommand,
    unbind_server::UnbindServerCommand,
};
use logging::{LogFormat, LogSettings};
use output::{Output, OutputFormat};
use session::{exit_code, CliContext, CliError};

#[derive(Debug, Parser)]
#[command(name = "pairsync", version, about = "Bidirectional file synchronization client")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log encoding on stderr
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Bind a local folder to a server account
    BindServer(BindServerCommand),
    /// Remove the binding of a local folder
    UnbindServer(UnbindServerCommand),
    /// Synchronize a server folder
    BindRoot(BindRootCommand),
    /// Stop synchronizing a server folder
    UnbindRoot(UnbindRootCommand),
    /// Remove synchronization attributes and partial downloads
    CleanFolder(CleanFolderCommand),
    /// Run the engines in the foreground
    Console(ConsoleCommand),
    /// Show synchronization status
    Status(StatusCommand),
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => {
            let path = Config::default_path();
            if path.exists() {
                Config::load(&path)?
            } else {
                Config::default()
            }
        }
    };
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(CliError::InvalidConfig(errors).into());
    }
    Ok(config)
}

async fn run(cli: Cli, format: OutputFormat) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    let level = logging::resolve_level(
        cli.verbose,
        cli.quiet,
        cli.log_level.as_deref(),
        &config.logging.level,
    );
    let settings = LogSettings {
        level,
        format: cli
            .log_format
            .unwrap_or_else(|| LogFormat::from_config(&config.logging.format)),
        directory: config.logging.file.then(|| config.logs_dir()),
    };
    logging::init(&settings).context("Failed to initialize logging")?;
    tracing::debug!(home = %config.general.nxdrive_home.display(), "Configuration loaded");

    let ctx = CliContext {
        config: Arc::new(config),
        format,
    };

    match cli.command {
        Commands::BindServer(cmd) => cmd.execute(&ctx).await,
        Commands::UnbindServer(cmd) => cmd.execute(&ctx).await,
        Commands::BindRoot(cmd) => cmd.execute(&ctx).await,
        Commands::UnbindRoot(cmd) => cmd.execute(&ctx).await,
        Commands::CleanFolder(cmd) => cmd.execute(&ctx).await,
        Commands::Console(cmd) => cmd.execute(&ctx).await,
        Commands::Status(cmd) => cmd.execute(&ctx).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    match run(cli, format).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            Output::new(format).error(&format!("{:#}", err));
            ExitCode::from(exit_code(&err))
        }
    }
}
