use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::{Config, write_template};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, config_override: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(&format, config_override),
        ConfigCommands::Path => show_path(config_override),
        ConfigCommands::Init { force } => init_config(force, config_override),
    }
}

fn config_file(config_override: Option<&str>) -> Result<std::path::PathBuf> {
    match config_override {
        Some(p) => Ok(std::path::PathBuf::from(shellexpand::tilde(p).to_string())),
        None => Config::config_path(),
    }
}

fn show_config(format: &str, config_override: Option<&str>) -> Result<()> {
    let config = Config::load_with(config_override)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn show_path(config_override: Option<&str>) -> Result<()> {
    println!("{}", config_file(config_override)?.display());
    Ok(())
}

fn init_config(force: bool, config_override: Option<&str>) -> Result<()> {
    let path = config_file(config_override)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    write_template(&path)
}
