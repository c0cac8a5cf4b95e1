//! boxpilot-ctl: command-line controller for the boxpilot supervisor.
//!
//! Starts the supervisor on demand, issues one command and prints the result.
//! `watch` stays attached and prints status, output and error notifications.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use boxpilot::{DataDir, KernelService, ServiceConfig, ServiceEvent, VersionInfo};

#[derive(Parser, Debug)]
#[command(name = "boxpilot-ctl")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Channel of the supervisor to talk to.
    #[arg(long = "control-name", value_name = "NAME", global = true)]
    control_name: Option<String>,

    /// How long to wait for each response.
    #[arg(long = "timeout-ms", value_name = "MS", default_value_t = 5000, global = true)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the kernel.
    Start { config: Option<PathBuf> },
    /// Stop the kernel.
    Stop,
    /// Restart the kernel, optionally with a different config.
    Restart { config: Option<PathBuf> },
    /// Print whether the kernel is running.
    Status,
    /// Change the config used by the next start.
    SetConfig { config: PathBuf },
    /// Print boxpilot and kernel versions as JSON.
    Version,
    /// Stop the kernel and the supervisor.
    Shutdown,
    /// Follow status, output and errors until interrupted.
    Watch,
}

fn running_label(running: bool) -> &'static str {
    if running { "running" } else { "stopped" }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    boxpilot::logging::init_tracing();

    let channel = cli
        .control_name
        .unwrap_or_else(|| boxpilot::channel_name().to_string());
    let config = ServiceConfig::new(channel, DataDir::from_env())
        .with_rpc_timeout(Duration::from_millis(cli.timeout_ms));
    let service = KernelService::new(config);

    match cli.command {
        Command::Start { config } => {
            let running = service.start(config).await.context("start failed")?;
            println!("{}", running_label(running));
        }
        Command::Stop => {
            let running = service.stop().await.context("stop failed")?;
            println!("{}", running_label(running));
        }
        Command::Restart { config } => {
            let running = match config {
                Some(path) => service.restart_with_config(path).await,
                None => service.restart().await,
            }
            .context("restart failed")?;
            println!("{}", running_label(running));
        }
        Command::Status => {
            let running = service.status().await.context("status failed")?;
            println!("{}", running_label(running));
        }
        Command::SetConfig { config } => {
            let applied = service
                .set_config_path(config)
                .await
                .context("set-config failed")?;
            println!("{}", applied.display());
        }
        Command::Version => {
            let mut info = VersionInfo::new();
            match service.kernel_version().await {
                Ok(version) => info = info.with_kernel(version),
                Err(e) => tracing::warn!(error = %e, "Kernel version unavailable"),
            }
            println!("{}", serde_json::to_string(&info)?);
        }
        Command::Shutdown => {
            service.shutdown_manager().await.context("shutdown failed")?;
        }
        Command::Watch => watch(&service).await?,
    }
    Ok(())
}

async fn watch(service: &KernelService) -> Result<()> {
    let mut events = service.subscribe();
    let running = service.status().await.context("status failed")?;
    println!("status: {}", running_label(running));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ServiceEvent::StatusChanged(running)) => {
                    println!("status: {}", running_label(running));
                    if !running && !service.is_connected() {
                        anyhow::bail!("lost connection to manager");
                    }
                }
                Ok(ServiceEvent::OutputReceived(text)) => print!("{text}"),
                Ok(ServiceEvent::ErrorOccurred(message)) => eprintln!("error: {message}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped notifications");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
