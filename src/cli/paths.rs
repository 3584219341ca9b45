//! CLI subcommand: `zonewall paths`
//!
//! Prints all resolved paths for debugging and scripting.

use anyhow::Result;

use crate::config::Config;

pub fn run(config: &Config) -> Result<()> {
    let paths = &config.paths;

    println!("zonewall Paths");
    println!("==============");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  zones:          {}", paths.zones_dir().display());
    println!("  machine:        {}", paths.machine_settings().display());
    println!("  profiles:       {}", paths.profile_catalog().display());
    println!("  passphrase:     {}", paths.passphrase_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!("  crash log:      {}", paths.crash_log().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  PID file:       {}", paths.pid_file().display());
    println!("  socket:         {}", config.socket_path().display());

    Ok(())
}
