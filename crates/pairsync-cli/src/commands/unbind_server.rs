//! `pairsync unbind-server` - Forget a bound account
//!
//! Purges the engine database, strips the client attributes from the
//! local folder and removes the binding. Local files stay in place.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use tracing::{info, warn};

use crate::output::Output;
use crate::session::CliContext;

#[derive(Debug, Args)]
pub struct UnbindServerCommand {
    /// Folder whose binding is removed
    #[arg(long)]
    pub local_folder: PathBuf,
}

impl UnbindServerCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = Output::new(ctx.format);
        let mut bindings = ctx.bindings()?;
        let binding = ctx.binding(&self.local_folder)?;

        let engine = ctx.open_engine(&binding).await?;
        let report = engine
            .unbind()
            .await
            .with_context(|| format!("Failed to unbind {}", binding.local_folder.display()))?;
        drop(engine);

        let db_path = binding.database_path(&ctx.config.engines_dir());
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove engine database");
                }
            }
        }
        let sidecar = ctx
            .config
            .engines_dir()
            .join(format!("{}.xattrs.json", binding.uid));
        if sidecar.exists() {
            std::fs::remove_file(&sidecar).ok();
        }

        bindings.remove(&binding.local_folder);
        bindings.save(ctx.home())?;
        info!(uid = %binding.uid, "Binding removed");

        fmt.success(&format!(
            "Unbound {} from {}",
            binding.local_folder.display(),
            binding.server_url
        ));
        fmt.field("Attributes", &report.attributes.to_string());
        fmt.field("Temporary files", &report.tmp_files.to_string());
        fmt.json(&json!({
            "success": true,
            "uid": binding.uid,
            "attributes_removed": report.attributes,
            "tmp_files_removed": report.tmp_files,
        }));
        Ok(())
    }
}
