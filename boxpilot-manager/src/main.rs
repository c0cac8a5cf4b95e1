//! boxpilot-manager: owns the sing-box kernel and serves the local control
//! channel until a `shutdown` request, SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;

use boxpilot::ManagerConfig;

#[derive(Parser, Debug)]
#[command(name = "boxpilot-manager")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Channel to serve instead of the per-user default.
    #[arg(long = "control-name", value_name = "NAME")]
    control_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    boxpilot::logging::init_tracing();
    tracing::info!(version = boxpilot::BOXPILOT_VERSION, "boxpilot-manager starting");

    boxpilot::manager::run(ManagerConfig::new(cli.control_name))
        .await
        .context("manager failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_name_is_optional() {
        let cli = Cli::try_parse_from(["boxpilot-manager"]).unwrap();
        assert!(cli.control_name.is_none());

        let cli = Cli::try_parse_from(["boxpilot-manager", "--control-name", "x"]).unwrap();
        assert_eq!(cli.control_name.as_deref(), Some("x"));
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(Cli::try_parse_from(["boxpilot-manager", "--port", "1"]).is_err());
    }
}
