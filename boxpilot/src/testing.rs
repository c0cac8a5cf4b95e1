//! Test fixtures: a fake kernel laid out in a temporary data directory.
//!
//! The kernel executable is a symlink to `/bin/sh`, so `sing-box run -c <cfg>`
//! runs the `run` script in the kernel directory and `sing-box version` runs
//! the `version` script. The scripts are only ever read by the shell, never
//! executed directly.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use crate::paths::DataDir;
use crate::runner::RunnerConfig;

const RUN_SCRIPT: &str = r#"echo "kernel up"
echo "$2" > started.tmp && mv started.tmp started
trap 'echo "kernel stopping" >&2; exit 0' TERM
while :; do sleep 0.05 >/dev/null 2>&1; done
"#;

const STUBBORN_RUN_SCRIPT: &str = r#"trap '' TERM
echo "kernel up"
echo "$2" > started.tmp && mv started.tmp started
while :; do sleep 0.05 >/dev/null 2>&1; done
"#;

const VERSION_SCRIPT: &str = "echo 'sing-box version 1.9.3'\necho ''\necho 'Environment: go1.22.4 linux/amd64'\n";

pub struct FakeKernel {
    dir: TempDir,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::with_run_script(RUN_SCRIPT)
    }

    /// Kernel that ignores SIGTERM.
    pub fn stubborn() -> Self {
        Self::with_run_script(STUBBORN_RUN_SCRIPT)
    }

    fn with_run_script(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Self { dir };
        let data = kernel.data_dir();

        std::fs::create_dir_all(data.kernel_dir()).unwrap();
        std::os::unix::fs::symlink("/bin/sh", data.kernel_executable()).unwrap();
        std::fs::write(data.kernel_dir().join("run"), script).unwrap();
        std::fs::write(data.kernel_dir().join("version"), VERSION_SCRIPT).unwrap();

        let config = data.default_config();
        std::fs::create_dir_all(config.parent().unwrap()).unwrap();
        std::fs::write(&config, "{}").unwrap();
        kernel
    }

    pub fn data_dir(&self) -> DataDir {
        DataDir::new(self.dir.path())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::new(self.data_dir())
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir().default_config()
    }

    pub fn write_config(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("config").join(name);
        std::fs::write(&path, "{}").unwrap();
        path
    }

    pub fn remove_executable(&self) {
        std::fs::remove_file(self.data_dir().kernel_executable()).unwrap();
    }

    pub fn started_marker(&self) -> PathBuf {
        self.data_dir().kernel_dir().join("started")
    }

    /// Config path the most recent kernel was started with.
    pub fn started_with(&self) -> PathBuf {
        PathBuf::from(
            std::fs::read_to_string(self.started_marker())
                .unwrap()
                .trim(),
        )
    }

    pub async fn wait_until_started(&self) {
        let marker = self.started_marker();
        tokio::time::timeout(Duration::from_secs(10), async {
            while !marker.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fake kernel never started");
    }
}
