//! `pairsync clean-folder` - Strip synchronization leftovers from a folder
//!
//! Removes the extended attributes the client sets and the partial
//! download files. Works on bound and unbound folders alike.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use crate::output::Output;
use crate::session::CliContext;

#[derive(Debug, Args)]
pub struct CleanFolderCommand {
    /// Folder to clean
    #[arg(long)]
    pub local_folder: PathBuf,
}

impl CleanFolderCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = Output::new(ctx.format);
        if !self.local_folder.is_dir() {
            anyhow::bail!("{} is not a directory", self.local_folder.display());
        }

        let folder = self.local_folder.clone();
        let config = ctx.config.clone();
        let report = tokio::task::spawn_blocking(move || pairsync_sync::clean_folder(&folder, &config))
            .await?
            .with_context(|| format!("Failed to clean {}", self.local_folder.display()))?;

        fmt.success(&format!("Cleaned {}", self.local_folder.display()));
        fmt.field("Attributes", &report.attributes.to_string());
        fmt.field("Temporary files", &report.tmp_files.to_string());
        fmt.json(&json!({
            "success": true,
            "attributes_removed": report.attributes,
            "tmp_files_removed": report.tmp_files,
        }));
        Ok(())
    }
}
