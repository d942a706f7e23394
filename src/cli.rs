//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Process exit codes. `0` is normal; the rest follow the documented
/// contract for scripting around the agent.
pub mod exit {
    pub const OK: i32 = exitcode::OK;
    pub const INVALID_ARGUMENT: i32 = 1;
    pub const INVALID_CONFIG: i32 = 2;
    pub const RUNTIME_ERROR: i32 = 3;
}

#[derive(Debug, Parser)]
#[command(
    name = "kinesistap",
    about = "Log-tailing telemetry agent with durable buffering and regional failover",
    version
)]
pub struct Cli {
    /// Configuration directory; also settable via KINESISTAP_CONFIG_DIR.
    #[arg(long, env = "KINESISTAP_CONFIG_DIR", global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent (the default when no command is given).
    Run,
    /// Validate a configuration file and report its wiring.
    Validate { path: PathBuf },
    /// Print the status of a running agent.
    Status,
}

impl Cli {
    pub fn resolved_config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(default_config_dir)
    }
}

pub fn default_config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let program_data =
            std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".to_owned());
        PathBuf::from(program_data).join("Amazon").join("KinesisTap")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/amazon/kinesistap")
    }
}
