//! Version information reported by the controller CLI.

/// boxpilot version from Cargo.toml
pub const BOXPILOT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub boxpilot: &'static str,
    /// Kernel version as reported by the supervisor, if it could be queried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            boxpilot: BOXPILOT_VERSION,
            kernel: None,
        }
    }
}

impl VersionInfo {
    /// Build info for this binary, kernel unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the kernel version string.
    pub fn with_kernel(mut self, version: String) -> Self {
        self.kernel = Some(version);
        self
    }
}
