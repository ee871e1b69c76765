//! Wiring shared by the commands: stores, remote clients, engines and
//! shutdown signals

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pairsync_core::config::{Config, ValidationError};
use pairsync_core::features::FeatureFlags;
use pairsync_core::ports::{IPairStateStore, RemoteError};
use pairsync_remote::{Credentials, RemoteClient, RemoteProvider};
use pairsync_store::{DatabasePool, SqlitePairStore};
use pairsync_sync::{Engine, ErrorKind, SyncError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bindings::{Binding, Bindings};
use crate::output::OutputFormat;

/// Engine config key holding the device token
pub const TOKEN_KEY: &str = "remote_token";

/// Failures mapped to dedicated exit codes
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid configuration: {}", join(.0))]
    InvalidConfig(Vec<ValidationError>),

    #[error("{} is not bound to a server, run 'pairsync bind-server' first", .0.display())]
    NotBound(PathBuf),

    #[error("No device token stored for {0}, bind the server again")]
    MissingToken(String),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Process exit code for a failed command
///
/// 2 for configuration errors, 3 for authentication failures, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<CliError>() {
            match err {
                CliError::InvalidConfig(_) => return 2,
                CliError::MissingToken(_) => return 3,
                CliError::NotBound(_) => {}
            }
        }
        if let Some(RemoteError::Unauthorized) = cause.downcast_ref::<RemoteError>() {
            return 3;
        }
        if let Some(err) = cause.downcast_ref::<SyncError>() {
            if err.kind() == ErrorKind::Authentication {
                return 3;
            }
        }
    }
    1
}

/// What every command receives
pub struct CliContext {
    pub config: Arc<Config>,
    pub format: OutputFormat,
}

impl CliContext {
    pub fn home(&self) -> &Path {
        &self.config.general.nxdrive_home
    }

    pub fn bindings(&self) -> Result<Bindings> {
        Bindings::load(self.home())
    }

    /// The binding of `folder`, or [`CliError::NotBound`]
    pub fn binding(&self, folder: &Path) -> Result<Binding> {
        self.bindings()?
            .find(folder)
            .cloned()
            .ok_or_else(|| CliError::NotBound(folder.to_path_buf()).into())
    }

    /// Opens the database of an engine, creating it when needed
    pub async fn open_store(&self, binding: &Binding) -> Result<Arc<SqlitePairStore>> {
        let path = binding.database_path(&self.config.engines_dir());
        let pool = DatabasePool::new(&path)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        debug!(path = %path.display(), "Engine database opened");
        Ok(Arc::new(SqlitePairStore::new(pool.pool().clone())))
    }

    /// Per-request timeout of the engine clients
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.network.timeout)
    }

    /// Timeout of the credential exchange done when binding
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.network.handshake_timeout)
    }

    pub fn client(
        &self,
        server_url: &str,
        credentials: Credentials,
        uid: &str,
        timeout: Duration,
    ) -> Result<RemoteClient> {
        let client = RemoteClient::with_timeout(server_url, credentials, timeout)
            .context("Failed to build the HTTP client")?
            .with_device_id(uid);
        Ok(client)
    }

    /// Builds the engine of a binding with its stored device token
    pub async fn open_engine(&self, binding: &Binding) -> Result<Engine> {
        let store = self.open_store(binding).await?;
        let token = store
            .get_config(TOKEN_KEY)
            .await?
            .ok_or_else(|| CliError::MissingToken(binding.user.clone()))?;
        let client = self.client(
            &binding.server_url,
            Credentials::Token(token),
            &binding.uid,
            self.request_timeout(),
        )?;
        let features = Arc::new(FeatureFlags::from_config(&self.config.features));

        Ok(Engine::new(
            self.config.clone(),
            features,
            store,
            Arc::new(RemoteProvider::new(client)),
            binding.local_folder.clone(),
            binding.uid.clone(),
        ))
    }
}

/// Cancels `token` on SIGINT or SIGTERM
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_invalid_config() {
        let err = anyhow::Error::new(CliError::InvalidConfig(vec![ValidationError {
            field: "sync.delay".to_string(),
            message: "must be positive".to_string(),
        }]));
        assert_eq!(exit_code(&err), 2);
        assert!(err.to_string().contains("sync.delay: must be positive"));
    }

    #[test]
    fn test_exit_code_for_rejected_credentials() {
        let err = anyhow::Error::new(RemoteError::Unauthorized).context("Failed to bind");
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::new(SyncError::Remote(RemoteError::Unauthorized));
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::new(CliError::MissingToken("alice".to_string()));
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn test_exit_code_for_other_failures() {
        let err = anyhow::anyhow!("disk full");
        assert_eq!(exit_code(&err), 1);

        let err = anyhow::Error::new(CliError::NotBound(PathBuf::from("/data/Drive")));
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn test_timeouts_come_from_network_settings() {
        let mut config = Config::default();
        config.network.timeout = 7;
        config.network.handshake_timeout = 90;
        let ctx = CliContext {
            config: Arc::new(config),
            format: OutputFormat::Human,
        };
        assert_eq!(ctx.request_timeout(), Duration::from_secs(7));
        assert_eq!(ctx.handshake_timeout(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_open_engine_requires_a_token() {
        let home = tempfile::TempDir::new().unwrap();
        let config = pairsync_core::config::ConfigBuilder::new()
            .nxdrive_home(home.path().to_path_buf())
            .build();
        let ctx = CliContext {
            config: Arc::new(config),
            format: OutputFormat::Human,
        };
        let binding = Binding {
            uid: "abc".to_string(),
            server_url: "http://localhost:1".to_string(),
            user: "alice".to_string(),
            local_folder: home.path().join("Drive"),
        };

        let err = ctx.open_engine(&binding).await.err().unwrap();
        assert_eq!(exit_code(&err), 3);
    }
}
