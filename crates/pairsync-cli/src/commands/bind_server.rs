//! `pairsync bind-server` - Bind a local folder to a server account
//!
//! Exchanges the user's credentials for a device token, records the
//! binding in `bindings.yaml` and prepares the engine database with the
//! token and the root pair.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use pairsync_core::ports::{IPairStateStore, IRemoteClient};
use pairsync_remote::{Credentials, RemoteProvider};
use serde_json::json;
use tracing::info;

use crate::bindings::Binding;
use crate::output::Output;
use crate::session::{CliContext, TOKEN_KEY};

/// Environment variable read when `--password` is not given
pub const PASSWORD_ENV: &str = "PAIRSYNC_PASSWORD";

#[derive(Debug, Args)]
pub struct BindServerCommand {
    /// Folder to synchronize
    #[arg(long)]
    pub local_folder: PathBuf,

    /// Account name on the server
    #[arg(long)]
    pub user: String,

    /// Account password (defaults to $PAIRSYNC_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// Server URL, e.g. https://docs.example.com/nuxeo
    pub server_url: String,
}

impl BindServerCommand {
    fn password(&self) -> Result<String> {
        match &self.password {
            Some(password) => Ok(password.clone()),
            None => std::env::var(PASSWORD_ENV)
                .with_context(|| format!("No password given, use --password or set {PASSWORD_ENV}")),
        }
    }

    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = Output::new(ctx.format);
        let mut bindings = ctx.bindings()?;
        if let Some(existing) = bindings.find(&self.local_folder) {
            anyhow::bail!(
                "{} is already bound to {} as {}",
                existing.local_folder.display(),
                existing.server_url,
                existing.user
            );
        }

        let uid = uuid::Uuid::new_v4().simple().to_string();
        let credentials = Credentials::Basic {
            username: self.user.clone(),
            password: self.password()?,
        };
        let client = ctx.client(&self.server_url, credentials, &uid, ctx.handshake_timeout())?;
        let remote = RemoteProvider::new(client);

        fmt.info(&format!("Connecting to {}...", self.server_url));
        let user = remote
            .fetch_user()
            .await
            .with_context(|| format!("Failed to authenticate against {}", self.server_url))?;
        let token = user
            .token
            .context("The server did not deliver a device token")?;
        info!(user = %user.username, uid = %uid, "Credentials accepted");

        std::fs::create_dir_all(&self.local_folder).with_context(|| {
            format!("Failed to create {}", self.local_folder.display())
        })?;
        let local_folder = std::fs::canonicalize(&self.local_folder)?;
        let binding = Binding {
            uid,
            server_url: self.server_url.trim_end_matches('/').to_string(),
            user: user.username.clone(),
            local_folder,
        };

        let store = ctx.open_store(&binding).await?;
        store.set_config("server_url", &binding.server_url).await?;
        store.set_config("remote_user", &binding.user).await?;
        store.set_config(TOKEN_KEY, &token).await?;

        let engine = ctx.open_engine(&binding).await?;
        engine.init_root().await?;

        bindings.add(binding.clone())?;
        bindings.save(ctx.home())?;

        fmt.success(&format!(
            "Bound {} to {} as {}",
            binding.local_folder.display(),
            binding.server_url,
            binding.user
        ));
        fmt.json(&json!({
            "success": true,
            "uid": binding.uid,
            "server_url": binding.server_url,
            "user": binding.user,
            "local_folder": binding.local_folder,
        }));
        Ok(())
    }
}
