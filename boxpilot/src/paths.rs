//! Filesystem layout shared by the controller and the supervisor.
//!
//! ```text
//! <data>/core/sing-box        kernel executable (working directory of the kernel)
//! <data>/config/config.json   default kernel config
//! ```

use std::path::{Path, PathBuf};

/// Overrides the data directory for both processes.
pub const DATA_DIR_ENV: &str = "BOXPILOT_DATA_DIR";

const KERNEL_DIR: &str = "core";
const CONFIG_DIR: &str = "config";
const DEFAULT_CONFIG_FILE: &str = "config.json";

#[cfg(windows)]
const KERNEL_BINARY: &str = "sing-box.exe";
#[cfg(not(windows))]
const KERNEL_BINARY: &str = "sing-box";

#[cfg(windows)]
const MANAGER_BINARY: &str = "boxpilot-manager.exe";
#[cfg(not(windows))]
const MANAGER_BINARY: &str = "boxpilot-manager";

/// Resolved data directory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Data directory rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$BOXPILOT_DATA_DIR`, else the platform local data dir, else a
    /// directory next to the working directory.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::new(dir);
        }
        match dirs::data_local_dir() {
            Some(dir) => Self::new(dir.join(crate::naming::PRODUCT)),
            None => Self::new("boxpilot-data"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the kernel binary and its working files.
    pub fn kernel_dir(&self) -> PathBuf {
        self.root.join(KERNEL_DIR)
    }

    /// Path of the `sing-box` binary.
    pub fn kernel_executable(&self) -> PathBuf {
        self.kernel_dir().join(KERNEL_BINARY)
    }

    pub fn default_config(&self) -> PathBuf {
        self.root.join(CONFIG_DIR).join(DEFAULT_CONFIG_FILE)
    }
}

/// Supervisor executable expected next to the running controller binary.
pub fn manager_executable() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| std::io::Error::other("controller executable has no parent directory"))?;
    Ok(dir.join(MANAGER_BINARY))
}
