//! Kernel runner - owns the sing-box child process.
//!
//! Flow:
//! 1. `start` validates the kernel executable and config, spawns the kernel,
//!    and hands the `Child` to a monitor task
//! 2. Output readers republish stdout/stderr chunks as events
//! 3. `stop` asks the monitor to terminate; the monitor force-kills after the
//!    grace period
//! 4. The monitor reports the exit back to the runner, which classifies it and
//!    performs a pending restart if one was requested
//!
//! All runner state lives in one actor task, so commands are applied in
//! arrival order and only the monitor ever touches the child handle.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{Event, LogStream};
use crate::paths::DataDir;
use crate::process::{Launch, ProcessControl, SpawnError, SystemProcessControl, spawn_confirmed};

/// Kernel output is uncoloured only with this override; colour codes would
/// end up in the relayed log lines.
const KERNEL_ENV: &[(&str, &str)] = &[("NO_COLOR", "1")];

const OUTPUT_CHUNK_SIZE: usize = 8 * 1024;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors returned to the caller of a runner command.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Kernel executable not found: {}", .0.display())]
    KernelNotFound(PathBuf),
    #[error("Config file not found")]
    ConfigNotFound(PathBuf),
    #[error("Failed to start kernel: {0}")]
    Spawn(#[source] SpawnError),
    #[error("Kernel did not start within {0:?}")]
    StartTimeout(Duration),
    #[error("Kernel version query failed: {0}")]
    Version(String),
    #[error("kernel runner is not running")]
    Closed,
}

impl RunnerError {
    fn into_process_error(self) -> ProcessError {
        match self {
            Self::StartTimeout(timeout) => {
                ProcessError::TimedOut(format!("no start confirmation within {timeout:?}"))
            }
            other => ProcessError::FailedToStart(other.to_string()),
        }
    }
}

/// Classified kernel process failures, published as error events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("Kernel failed to start: {0}")]
    FailedToStart(String),
    #[error("Kernel crashed: {0}")]
    Crashed(String),
    #[error("Kernel timed out: {0}")]
    TimedOut(String),
    #[error("Kernel process error: {0}")]
    Unknown(String),
}

/// Events published by the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Status(bool),
    Output { stream: LogStream, text: String },
    Error(ProcessError),
}

impl From<RunnerEvent> for Event {
    fn from(event: RunnerEvent) -> Self {
        match event {
            RunnerEvent::Status(running) => Event::Status { running },
            RunnerEvent::Output { stream, text } => Event::Log {
                stream,
                message: text,
            },
            RunnerEvent::Error(e) => Event::Error {
                message: e.to_string(),
            },
        }
    }
}

/// Kernel process handle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    NotRunning,
    Starting,
    Running { pid: Option<u32> },
}

impl KernelState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

pub struct RunnerConfig {
    pub data_dir: DataDir,
    pub start_timeout: Duration,
    pub stop_grace: Duration,
    pub version_timeout: Duration,
    pub control: Arc<dyn ProcessControl>,
}

impl RunnerConfig {
    /// Default timeouts for the kernel under `data_dir`.
    pub fn new(data_dir: DataDir) -> Self {
        Self {
            data_dir,
            start_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
            version_timeout: Duration::from_secs(5),
            control: Arc::new(SystemProcessControl),
        }
    }

    /// How long a spawn may take to be confirmed.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Wait after SIGTERM before the kernel is killed.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Bound on `sing-box version`.
    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    /// Replace the platform process hooks.
    pub fn with_process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.control = control;
        self
    }
}

/// Kernel operations the IPC server dispatches to.
///
/// This abstraction enables testing the server without a real kernel.
#[async_trait]
pub trait KernelControl: Send + Sync {
    async fn start(&self, config: Option<PathBuf>) -> Result<bool, RunnerError>;

    /// Resolves once the kernel has exited (or immediately if not running).
    async fn stop(&self) -> Result<bool, RunnerError>;

    async fn restart(&self, config: Option<PathBuf>) -> Result<bool, RunnerError>;

    async fn status(&self) -> Result<bool, RunnerError>;

    async fn set_config(&self, path: PathBuf) -> Result<PathBuf, RunnerError>;

    async fn version(&self) -> Result<String, RunnerError>;

    /// Stop the kernel and wait for it to exit.
    async fn shutdown(&self) -> Result<(), RunnerError>;
}

enum Command {
    Start {
        config: Option<PathBuf>,
        reply: oneshot::Sender<Result<bool, RunnerError>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Restart {
        config: Option<PathBuf>,
        reply: oneshot::Sender<Result<bool, RunnerError>>,
    },
    State {
        reply: oneshot::Sender<KernelState>,
    },
    SetConfig {
        path: PathBuf,
        reply: oneshot::Sender<PathBuf>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the runner actor.
#[derive(Clone)]
pub struct KernelRunner {
    commands: mpsc::Sender<Command>,
    config: Arc<RunnerConfig>,
}

impl KernelRunner {
    /// Spawn the runner actor. Events are delivered on the returned receiver.
    pub fn spawn(config: RunnerConfig) -> (Self, mpsc::UnboundedReceiver<RunnerEvent>) {
        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let actor = RunnerActor {
            config: Arc::clone(&config),
            events: events_tx,
            exit_tx,
            phase: Phase::NotRunning,
            config_path: None,
            pending_config: None,
            stop_requested: false,
            restart_pending: false,
            generation: 0,
            stop_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(commands_rx, exit_rx));

        (
            Self {
                commands: commands_tx,
                config,
            },
            events_rx,
        )
    }

    pub async fn state(&self) -> Result<KernelState, RunnerError> {
        self.request(|reply| Command::State { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| RunnerError::Closed)?;
        rx.await.map_err(|_| RunnerError::Closed)
    }
}

#[async_trait]
impl KernelControl for KernelRunner {
    async fn start(&self, config: Option<PathBuf>) -> Result<bool, RunnerError> {
        self.request(|reply| Command::Start { config, reply }).await?
    }

    async fn stop(&self) -> Result<bool, RunnerError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    async fn restart(&self, config: Option<PathBuf>) -> Result<bool, RunnerError> {
        self.request(|reply| Command::Restart { config, reply }).await?
    }

    async fn status(&self) -> Result<bool, RunnerError> {
        Ok(self.state().await?.is_running())
    }

    async fn set_config(&self, path: PathBuf) -> Result<PathBuf, RunnerError> {
        self.request(|reply| Command::SetConfig { path, reply }).await
    }

    async fn version(&self) -> Result<String, RunnerError> {
        let kernel = self.config.data_dir.kernel_executable();
        if !kernel.is_file() {
            return Err(RunnerError::KernelNotFound(kernel));
        }

        let launch = Launch::new(&kernel)
            .arg("version")
            .current_dir(self.config.data_dir.kernel_dir())
            .capture_output()
            .kill_on_drop();
        let child = self
            .config
            .control
            .spawn(&launch)
            .map_err(|e| RunnerError::Version(e.to_string()))?;

        let output = tokio::time::timeout(self.config.version_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                RunnerError::Version(format!("no output within {:?}", self.config.version_timeout))
            })?
            .map_err(|e| RunnerError::Version(e.to_string()))?;

        Ok(extract_version(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn shutdown(&self) -> Result<(), RunnerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?")
        .expect("version regex is valid")
});

/// First semver-shaped token in `output`, else the trimmed output.
pub fn extract_version(output: &str) -> String {
    match VERSION_PATTERN.find(output) {
        Some(m) => m.as_str().to_string(),
        None => output.trim().to_string(),
    }
}

enum Phase {
    NotRunning,
    Starting,
    Running(RunningKernel),
}

struct RunningKernel {
    pid: Option<u32>,
    generation: u64,
    terminate: mpsc::UnboundedSender<()>,
}

struct ExitNotice {
    generation: u64,
    outcome: std::io::Result<ExitStatus>,
}

struct RunnerActor {
    config: Arc<RunnerConfig>,
    events: mpsc::UnboundedSender<RunnerEvent>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    phase: Phase,
    /// Last config the kernel was started with (or set via `setConfig`).
    config_path: Option<PathBuf>,
    /// Config requested by a restart that is waiting for the exit.
    pending_config: Option<PathBuf>,
    stop_requested: bool,
    restart_pending: bool,
    generation: u64,
    stop_waiters: Vec<oneshot::Sender<bool>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl RunnerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut exits: mpsc::UnboundedReceiver<ExitNotice>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::debug!("All runner handles dropped");
                        break;
                    };
                    self.handle(cmd).await;
                }
                Some(notice) = exits.recv() => {
                    self.on_exit(notice).await;
                }
            }

            if !self.shutdown_waiters.is_empty() && !self.is_running() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }
        }
        tracing::info!("Kernel runner exiting");
    }

    fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running(_))
    }

    fn state(&self) -> KernelState {
        match &self.phase {
            Phase::NotRunning => KernelState::NotRunning,
            Phase::Starting => KernelState::Starting,
            Phase::Running(kernel) => KernelState::Running { pid: kernel.pid },
        }
    }

    fn emit(&self, event: RunnerEvent) {
        // Receiver gone means the server is shutting down.
        let _ = self.events.send(event);
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start { config, reply } => {
                let result = if self.is_running() && self.stop_requested {
                    // A stop is in flight; start again once it lands.
                    self.schedule_restart(config).map(|()| true)
                } else {
                    self.start(config).await
                };
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.restart_pending = false;
                self.pending_config = None;
                if self.request_stop() {
                    self.stop_waiters.push(reply);
                } else {
                    let _ = reply.send(false);
                }
            }
            Command::Restart { config, reply } => {
                let result = if self.is_running() {
                    self.schedule_restart(config).map(|()| {
                        self.request_stop();
                        true
                    })
                } else {
                    self.start(config).await
                };
                let _ = reply.send(result);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state());
            }
            Command::SetConfig { path, reply } => {
                tracing::info!(config = %path.display(), "Config path set");
                self.config_path = Some(path.clone());
                let _ = reply.send(path);
            }
            Command::Shutdown { reply } => {
                self.restart_pending = false;
                self.pending_config = None;
                self.request_stop();
                self.shutdown_waiters.push(reply);
            }
        }
    }

    fn resolve_config(&self, requested: Option<PathBuf>) -> PathBuf {
        requested
            .or_else(|| self.config_path.clone())
            .unwrap_or_else(|| self.config.data_dir.default_config())
    }

    /// Checks that a start with `config` could proceed, without spawning.
    fn validate(&self, config: &std::path::Path) -> Result<PathBuf, RunnerError> {
        let kernel = self.config.data_dir.kernel_executable();
        if !kernel.is_file() {
            return Err(RunnerError::KernelNotFound(kernel));
        }
        if !config.is_file() {
            return Err(RunnerError::ConfigNotFound(config.to_path_buf()));
        }
        Ok(kernel)
    }

    fn schedule_restart(&mut self, config: Option<PathBuf>) -> Result<(), RunnerError> {
        let resolved = self.resolve_config(config);
        self.validate(&resolved)?;
        tracing::info!(config = %resolved.display(), "Restart pending until kernel exits");
        self.pending_config = Some(resolved);
        self.restart_pending = true;
        Ok(())
    }

    /// Returns false if there was nothing to stop.
    fn request_stop(&mut self) -> bool {
        let Phase::Running(kernel) = &self.phase else {
            tracing::info!("Stop requested but kernel is not running");
            return false;
        };
        if !self.stop_requested {
            tracing::info!(pid = ?kernel.pid, "Stopping kernel");
            self.stop_requested = true;
            if kernel.terminate.send(()).is_err() {
                tracing::warn!("Kernel monitor already gone");
            }
        }
        true
    }

    async fn start(&mut self, requested: Option<PathBuf>) -> Result<bool, RunnerError> {
        if self.is_running() {
            tracing::info!("Kernel already running");
            return Ok(true);
        }

        let config_path = self.resolve_config(requested);
        let kernel = self.validate(&config_path).inspect_err(|e| {
            tracing::warn!(error = %e, config = %config_path.display(), "Refusing to start kernel");
        })?;
        self.config_path = Some(config_path.clone());

        let launch = Launch::new(&kernel)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .current_dir(self.config.data_dir.kernel_dir())
            .capture_output()
            .kill_on_drop();
        let launch = KERNEL_ENV
            .iter()
            .fold(launch, |launch, (k, v)| launch.env(*k, *v));

        tracing::info!(kernel = %kernel.display(), config = %config_path.display(), "Starting kernel");
        self.phase = Phase::Starting;

        let spawned = spawn_confirmed(
            Arc::clone(&self.config.control),
            launch,
            self.config.start_timeout,
        )
        .await;
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.phase = Phase::NotRunning;
                tracing::error!(error = %e, "Kernel failed to start");
                return Err(match e {
                    SpawnError::Timeout(timeout) => RunnerError::StartTimeout(timeout),
                    other => RunnerError::Spawn(other),
                });
            }
        };

        let pid = child.id();
        let mut relays = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            relays.push(relay_output(stdout, LogStream::Stdout, self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(relay_output(stderr, LogStream::Stderr, self.events.clone()));
        }

        self.generation += 1;
        let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
        tokio::spawn(monitor(
            child,
            self.generation,
            Arc::clone(&self.config.control),
            self.config.stop_grace,
            terminate_rx,
            relays,
            self.exit_tx.clone(),
        ));

        self.phase = Phase::Running(RunningKernel {
            pid,
            generation: self.generation,
            terminate: terminate_tx,
        });
        self.stop_requested = false;
        tracing::info!(pid = ?pid, "Kernel running");
        self.emit(RunnerEvent::Status(true));
        Ok(true)
    }

    async fn on_exit(&mut self, notice: ExitNotice) {
        match &self.phase {
            Phase::Running(kernel) if kernel.generation == notice.generation => {}
            _ => {
                tracing::debug!(generation = notice.generation, "Ignoring exit of stale kernel");
                return;
            }
        }
        self.phase = Phase::NotRunning;
        let expected = std::mem::take(&mut self.stop_requested);

        match notice.outcome {
            Ok(status) if expected => {
                tracing::info!(%status, "Kernel stopped");
            }
            Ok(status) if status.success() => {
                tracing::info!("Kernel exited on its own");
            }
            Ok(status) => {
                tracing::warn!(%status, "Kernel crashed");
                self.emit(RunnerEvent::Error(ProcessError::Crashed(describe_exit(status))));
            }
            Err(e) if expected => {
                tracing::warn!(error = %e, "Failed to observe requested kernel exit");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to observe kernel exit");
                self.emit(RunnerEvent::Error(ProcessError::Unknown(e.to_string())));
            }
        }
        self.emit(RunnerEvent::Status(false));

        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(false);
        }

        if std::mem::take(&mut self.restart_pending) {
            let config = self.pending_config.take();
            if let Err(e) = self.start(config).await {
                self.emit(RunnerEvent::Error(e.into_process_error()));
            }
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    status.to_string()
}

/// Owns the child until it exits; terminate requests escalate to a force-kill
/// after `grace`.
async fn monitor(
    mut child: Child,
    generation: u64,
    control: Arc<dyn ProcessControl>,
    grace: Duration,
    mut terminate: mpsc::UnboundedReceiver<()>,
    relays: Vec<JoinHandle<()>>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
) {
    let outcome = tokio::select! {
        status = child.wait() => status,
        // A dropped sender means the runner is gone; the kernel goes with it.
        _ = terminate.recv() => {
            if let Err(e) = control.terminate(&child) {
                tracing::warn!(error = %e, "Failed to request kernel termination");
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(?grace, "Kernel ignored termination, force killing");
                    if let Err(e) = control.force_kill(&mut child) {
                        tracing::error!(error = %e, "Failed to kill kernel");
                    }
                    child.wait().await
                }
            }
        }
    };

    // Let the readers flush what the kernel wrote before it died.
    for relay in relays {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, relay).await.is_err() {
            tracing::debug!("Output relay still open after kernel exit");
        }
    }

    let _ = exit_tx.send(ExitNotice {
        generation,
        outcome,
    });
}

fn relay_output<R>(
    mut reader: R,
    stream: LogStream,
    events: mpsc::UnboundedSender<RunnerEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, stream = stream.as_str(), "Kernel output read failed");
                    break;
                }
            };
            pending.extend_from_slice(&buf[..n]);
            let text = take_utf8(&mut pending);
            if text.is_empty() {
                continue;
            }
            tracing::debug!(target: "boxpilot::kernel", stream = stream.as_str(), "{}", text.trim_end());
            if events.send(RunnerEvent::Output { stream, text }).is_err() {
                return;
            }
        }
        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            let _ = events.send(RunnerEvent::Output { stream, text });
        }
    })
}

/// Drains the decodable prefix of `pending`, keeping an incomplete trailing
/// UTF-8 sequence for the next read. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let keep = match std::str::from_utf8(pending) {
        Ok(_) => 0,
        Err(e) if e.error_len().is_none() => pending.len() - e.valid_up_to(),
        Err(_) => 0,
    };
    let tail = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}
