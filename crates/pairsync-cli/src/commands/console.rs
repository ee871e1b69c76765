//! `pairsync console` - Run every bound engine in the foreground
//!
//! Engines run until SIGINT or SIGTERM. With `--sync-and-quit` each
//! engine performs one full synchronization and the command returns once
//! all of them are idle.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Args;
use pairsync_sync::{Engine, EngineEvent};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::output::{Output, OutputFormat};
use crate::session::{shutdown_signal, CliContext};

#[derive(Debug, Args)]
pub struct ConsoleCommand {
    /// Synchronize once, then exit
    #[arg(long)]
    pub sync_and_quit: bool,
}

impl ConsoleCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let fmt = Output::new(ctx.format);
        let bindings = ctx.bindings()?;
        if bindings.engines.is_empty() {
            anyhow::bail!("No account is bound, run 'pairsync bind-server' first");
        }

        let mut engines = Vec::with_capacity(bindings.engines.len());
        for binding in &bindings.engines {
            engines.push(Arc::new(ctx.open_engine(binding).await?));
        }

        let shutdown = CancellationToken::new();
        tokio::spawn(shutdown_signal(shutdown.clone()));

        let reporters: Vec<JoinHandle<()>> = engines
            .iter()
            .map(|engine| {
                tokio::spawn(report_events(
                    engine.uid().to_string(),
                    engine.subscribe(),
                    ctx.format,
                ))
            })
            .collect();

        let result = if self.sync_and_quit {
            sync_once(&engines, &shutdown).await
        } else {
            run_until_shutdown(&engines, &shutdown).await
        };

        for reporter in reporters {
            reporter.abort();
        }

        match &result {
            Ok(()) => fmt.success("All engines stopped"),
            Err(e) => error!(error = %e, "Console exiting with error"),
        }
        result
    }
}

async fn run_until_shutdown(engines: &[Arc<Engine>], shutdown: &CancellationToken) -> Result<()> {
    let mut started = Vec::new();
    let mut failure = None;
    for engine in engines {
        match engine.start().await {
            Ok(()) => {
                info!(uid = engine.uid(), folder = %engine.local_folder().display(), "Engine running");
                started.push(engine.clone());
            }
            Err(e) => {
                failure = Some(anyhow!(e).context(format!("Engine {} failed to start", engine.uid())));
                break;
            }
        }
    }

    if failure.is_none() {
        shutdown.cancelled().await;
    }

    for engine in started {
        engine.stop().await;
    }
    failure.map_or(Ok(()), Err)
}

async fn sync_once(engines: &[Arc<Engine>], shutdown: &CancellationToken) -> Result<()> {
    let mut set = JoinSet::new();
    for engine in engines {
        let engine = engine.clone();
        set.spawn(async move {
            let uid = engine.uid().to_string();
            engine
                .sync_and_quit()
                .await
                .map_err(|e| anyhow!(e).context(format!("Engine {uid} failed to synchronize")))
        });
    }

    let collect = async {
        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(e) => failures.push(anyhow!(e)),
            }
        }
        failures
    };

    let failures = tokio::select! {
        failures = collect => failures,
        _ = shutdown.cancelled() => {
            info!("Interrupted, stopping engines");
            for engine in engines {
                engine.stop().await;
            }
            Vec::new()
        }
    };

    let mut failures = failures.into_iter();
    match failures.next() {
        None => Ok(()),
        Some(first) => {
            for other in failures {
                error!(error = %other, "Synchronization failed");
            }
            Err(first)
        }
    }
}

/// Forwards engine notifications to the log, or to stdout in JSON mode
async fn report_events(uid: String, mut events: broadcast::Receiver<EngineEvent>, format: OutputFormat) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if format == OutputFormat::Json {
                    let mut value = serde_json::to_value(&event).unwrap_or_default();
                    if let Some(map) = value.as_object_mut() {
                        map.insert("engine".to_string(), serde_json::Value::String(uid.clone()));
                    }
                    println!("{}", value);
                    continue;
                }
                match &event {
                    EngineEvent::InvalidCredentials => {
                        warn!(engine = %uid, "Credentials were rejected, bind the server again")
                    }
                    EngineEvent::NoSpaceLeft { path } => {
                        warn!(engine = %uid, path = %path.display(), "No space left on device")
                    }
                    EngineEvent::Conflicted { name, .. } => {
                        warn!(engine = %uid, name = %name, "Conflict detected")
                    }
                    EngineEvent::Unsynchronized { name, reason, .. } => {
                        warn!(engine = %uid, name = %name, reason = %reason, "Document left unsynchronized")
                    }
                    other => info!(engine = %uid, event = ?other, "Engine event"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(engine = %uid, skipped, "Engine events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
