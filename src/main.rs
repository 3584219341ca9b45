use anyhow::Result;
use clap::Parser;

use zonewall::cli::{self, Cli, Commands};
use zonewall::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_with(cli.config.as_deref())?;

    // Daemon start/restart must fork BEFORE starting the Tokio runtime
    #[cfg(unix)]
    if let Commands::Daemon(ref args) = cli.command {
        match args.command {
            cli::daemon::DaemonCommands::Start { foreground: false } => {
                return cli::daemon::daemonize_and_run(config, cli.verbose);
            }
            cli::daemon::DaemonCommands::Restart { foreground: false } => {
                cli::daemon::stop_sync(&config)?;
                return cli::daemon::daemonize_and_run(config, cli.verbose);
            }
            _ => {}
        }
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli, config))
}

async fn async_main(cli: Cli, config: Config) -> Result<()> {
    cli::init_logging(cli.verbose, &config.logging.level, true);

    match cli.command {
        Commands::Daemon(args) => cli::daemon::run(args, config).await,
        Commands::Config(args) => cli::config::run(args, cli.config.as_deref()),
        Commands::Paths => cli::paths::run(&config),
        Commands::Control(command) => cli::control::run(command, &config).await,
    }
}
