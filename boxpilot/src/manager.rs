//! Supervisor entry point: bind the channel, own the kernel, serve until told
//! to stop.

use std::sync::Arc;

use crate::bridge::transport::{ChannelAddr, ChannelListener};
use crate::paths::DataDir;
use crate::runner::{KernelControl, KernelRunner, RunnerConfig};
use crate::server::{IpcServer, ServerConfig};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("another manager is already serving {0}")]
    AlreadyRunning(String),
    #[error("failed to bind {channel}: {source}")]
    Bind {
        channel: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

pub struct ManagerConfig {
    pub channel_name: String,
    pub runner: RunnerConfig,
    pub server: ServerConfig,
}

impl ManagerConfig {
    /// `channel_name` overrides the per-user default.
    pub fn new(channel_name: Option<String>) -> Self {
        Self {
            channel_name: channel_name
                .unwrap_or_else(|| crate::naming::channel_name().to_string()),
            runner: RunnerConfig::new(DataDir::from_env()),
            server: ServerConfig::default(),
        }
    }
}

/// Run the supervisor until a `shutdown` request, SIGINT or SIGTERM. The
/// kernel is stopped before returning.
pub async fn run(config: ManagerConfig) -> Result<(), ManagerError> {
    let addr = ChannelAddr::for_name(&config.channel_name);
    let listener = ChannelListener::bind(addr).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            ManagerError::AlreadyRunning(config.channel_name.clone())
        } else {
            ManagerError::Bind {
                channel: config.channel_name.clone(),
                source,
            }
        }
    })?;

    tracing::info!(
        channel = %config.channel_name,
        data_dir = %config.runner.data_dir.root().display(),
        "Manager starting"
    );

    let (runner, events) = KernelRunner::spawn(config.runner);
    let server = IpcServer::new(
        listener,
        Arc::new(runner.clone()) as Arc<dyn KernelControl>,
        events,
        config.server,
    );
    let signals = shutdown_signal()?;

    tokio::select! {
        _ = server.run() => {
            tracing::info!("Shutdown requested by client");
        }
        _ = signals => {}
    }

    if let Err(e) = runner.shutdown().await {
        tracing::debug!(error = %e, "Runner already gone");
    }
    tracing::info!("Manager stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Handlers are installed before returning.
fn shutdown_signal() -> Result<impl Future<Output = ()>, ManagerError> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(ManagerError::Signal)?;

    Ok(async move {
        #[cfg(unix)]
        let terminate = async {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => tracing::info!("Received SIGINT, shutting down..."),
                    Err(e) => {
                        tracing::warn!(error = %e, "Ctrl+C handler unavailable");
                        std::future::pending::<()>().await;
                    }
                }
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }
    })
}
