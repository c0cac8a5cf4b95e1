//! boxpilot: out-of-process supervision of the sing-box kernel.
//!
//! The supervisor (`boxpilot-manager`) owns the kernel process and answers
//! line-delimited JSON requests on a per-user local channel. Controllers talk
//! to it through [`KernelService`].

mod version;

pub mod bridge;
pub mod client;
pub mod logging;
pub mod manager;
pub mod naming;
pub mod paths;
pub mod process;
pub mod runner;
pub mod server;
pub mod service;

#[cfg(all(test, unix))]
mod testing;

pub use client::{ClientError, ClientNotification, IpcClient};
pub use manager::{ManagerConfig, ManagerError};
pub use naming::channel_name;
pub use paths::DataDir;
pub use process::{Launch, ProcessControl, SpawnError, SystemProcessControl};
pub use runner::{
    KernelControl, KernelRunner, KernelState, ProcessError, RunnerConfig, RunnerError,
    RunnerEvent,
};
pub use server::{IpcServer, ServerConfig};
pub use service::{KernelService, ServiceConfig, ServiceError, ServiceEvent};
pub use version::{BOXPILOT_VERSION, VersionInfo};
