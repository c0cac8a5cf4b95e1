//! Process control primitives.
//!
//! Spawning, graceful termination and force-kill go through [`ProcessControl`]
//! so the platform mechanism is chosen in one place. Waiting is done on the
//! returned [`Child`] by whoever owns it.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("process did not start within {0:?}")]
    Timeout(Duration),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Everything needed to launch one child process.
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Pipe stdout/stderr back to the parent instead of discarding them.
    pub capture_output: bool,
    /// Put the child in its own process group so it outlives the parent's
    /// terminal session.
    pub detach: bool,
    pub kill_on_drop: bool,
}

impl Launch {
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            capture_output: false,
            detach: false,
            kill_on_drop: false,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Working directory for the child.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Pipe stdout and stderr instead of discarding them.
    pub fn capture_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Start the child in its own session.
    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    /// Kill the child when its handle is dropped.
    pub fn kill_on_drop(mut self) -> Self {
        self.kill_on_drop = true;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(self.kill_on_drop);

        if self.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        if self.detach {
            cmd.process_group(0);
        }
        cmd
    }
}

/// Extension point for platform process supervision.
pub trait ProcessControl: Send + Sync {
    fn spawn(&self, launch: &Launch) -> Result<Child, SpawnError>;

    /// Ask the process to exit. Must not block.
    fn terminate(&self, child: &Child) -> std::io::Result<()>;

    fn force_kill(&self, child: &mut Child) -> std::io::Result<()>;
}

/// SIGTERM / SIGKILL on unix, TerminateProcess elsewhere.
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn spawn(&self, launch: &Launch) -> Result<Child, SpawnError> {
        tracing::debug!(program = %launch.program.display(), args = ?launch.args, "Spawning process");
        Ok(launch.command().spawn()?)
    }

    #[cfg(unix)]
    fn terminate(&self, child: &Child) -> std::io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&self, _child: &Child) -> std::io::Result<()> {
        // No graceful console signal for a windowless child; the grace timer
        // escalates to force_kill.
        Ok(())
    }

    fn force_kill(&self, child: &mut Child) -> std::io::Result<()> {
        child.start_kill()
    }
}

/// Spawn and wait, bounded, for the OS to confirm the process started.
pub async fn spawn_confirmed(
    control: Arc<dyn ProcessControl>,
    launch: Launch,
    timeout: Duration,
) -> Result<Child, SpawnError> {
    let task = tokio::task::spawn_blocking(move || control.spawn(&launch));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SpawnError::Other(format!("spawn task failed: {join_err}"))),
        Err(_) => Err(SpawnError::Timeout(timeout)),
    }
}
