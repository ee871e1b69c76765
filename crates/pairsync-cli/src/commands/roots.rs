//! `pairsync bind-root` / `pairsync unbind-root` - Register or
//! unregister a server document as a synchronization root

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use crate::output::Output;
use crate::session::CliContext;

#[derive(Debug, Args)]
pub struct BindRootCommand {
    /// Folder of the bound account
    #[arg(long)]
    pub local_folder: PathBuf,

    /// Reference of the server folder to synchronize
    pub remote_ref: String,
}

impl BindRootCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = Output::new(ctx.format);
        let binding = ctx.binding(&self.local_folder)?;
        let engine = ctx.open_engine(&binding).await?;

        engine
            .bind_root(&self.remote_ref)
            .await
            .with_context(|| format!("Failed to register {} as a sync root", self.remote_ref))?;

        fmt.success(&format!("{} is now synchronized", self.remote_ref));
        fmt.json(&json!({"success": true, "bound": self.remote_ref}));
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct UnbindRootCommand {
    /// Folder of the bound account
    #[arg(long)]
    pub local_folder: PathBuf,

    /// Reference of the sync root to drop
    pub remote_ref: String,
}

impl UnbindRootCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = Output::new(ctx.format);
        let binding = ctx.binding(&self.local_folder)?;
        let engine = ctx.open_engine(&binding).await?;

        engine
            .unbind_root(&self.remote_ref)
            .await
            .with_context(|| format!("Failed to unregister sync root {}", self.remote_ref))?;

        fmt.success(&format!("{} is no longer synchronized", self.remote_ref));
        fmt.info("Its local copy is removed on the next synchronization");
        fmt.json(&json!({"success": true, "unbound": self.remote_ref}));
        Ok(())
    }
}
