pub mod config;
pub mod control;
pub mod daemon;
pub mod paths;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "zonewall")]
#[command(author, version, about = "Zone-based firewall policy daemon")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "ZONEWALL_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the daemon
    Daemon(daemon::DaemonArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved directory paths
    Paths,

    #[command(flatten)]
    Control(control::ControlCommands),
}

/// Install the tracing subscriber. `RUST_LOG` wins over `--verbose`, which
/// wins over the configured level.
pub fn init_logging(verbose: bool, configured: &str, ansi: bool) {
    let level = if verbose { "debug" } else { configured };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_ansi(ansi)
        .try_init();
}
