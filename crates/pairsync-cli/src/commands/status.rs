//! `pairsync status` - Display the state of the bound engines
//!
//! For each binding (or only the one of `--local-folder`) shows pair
//! counts, queue sizes, conflicts, errors and unsynchronized documents.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use pairsync_sync::{EngineStatus, PairSummary};
use serde_json::json;

use crate::bindings::Binding;
use crate::output::Output;
use crate::session::CliContext;

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Only show the engine bound to this folder
    #[arg(long)]
    pub local_folder: Option<PathBuf>,
}

impl StatusCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = Output::new(ctx.format);
        let bindings: Vec<Binding> = match &self.local_folder {
            Some(folder) => vec![ctx.binding(folder)?],
            None => ctx.bindings()?.engines,
        };

        if bindings.is_empty() {
            fmt.warn("No account is bound, run 'pairsync bind-server' first");
            fmt.json(&json!({"engines": []}));
            return Ok(());
        }

        let mut reports = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let engine = ctx.open_engine(binding).await?;
            let status = engine.status().await?;
            print_status(&fmt, binding, &status);
            reports.push(json!({
                "server_url": binding.server_url,
                "user": binding.user,
                "status": status,
            }));
        }
        fmt.json(&json!({ "engines": reports }));
        Ok(())
    }
}

fn print_status(fmt: &Output, binding: &Binding, status: &EngineStatus) {
    fmt.success(&format!(
        "{} ({} on {})",
        status.local_folder.display(),
        binding.user,
        binding.server_url
    ));
    let state = if status.suspended {
        "suspended"
    } else if !status.synchronization {
        "synchronization disabled"
    } else if status.queue.queued() + status.queue.in_flight > 0 {
        "syncing"
    } else {
        "idle"
    };
    fmt.field("State", state);
    fmt.field(
        "Documents",
        &format!("{} ({} synchronized)", status.pairs, status.synchronized),
    );
    fmt.field(
        "Queue",
        &format!(
            "{} folders, {} files, {} in progress",
            status.queue.local_folders + status.queue.remote_folders,
            status.queue.local_files + status.queue.remote_files,
            status.queue.in_flight
        ),
    );
    fmt.field(
        "Last sync",
        status.last_sync_date.as_deref().unwrap_or("never"),
    );

    list(fmt, "Conflicts", &status.conflicts);
    list(fmt, "Errors", &status.errors);
    list(fmt, "Unsynchronized", &status.unsynchronized);
}

fn list(fmt: &Output, title: &str, pairs: &[PairSummary]) {
    if pairs.is_empty() {
        return;
    }
    fmt.field(title, &pairs.len().to_string());
    for pair in pairs {
        match &pair.error {
            Some(error) => fmt.info(&format!(
                "  #{} {} [{}] {} (x{})",
                pair.id,
                pair.path.display(),
                pair.state,
                error,
                pair.error_count
            )),
            None => fmt.info(&format!("  #{} {} [{}]", pair.id, pair.path.display(), pair.state)),
        }
    }
}
