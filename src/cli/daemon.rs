use anyhow::Result;
use clap::{Args, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use daemonize::Daemonize;

use crate::config::Config;

const LOG_PREFIX: &str = "zonewall-";

/// Synchronously stop the daemon (for use before the Tokio runtime starts)
pub fn stop_sync(config: &Config) -> Result<()> {
    let pid_file = config.paths.pid_file();

    let Some(pid) = read_pid(&pid_file)? else {
        println!("Daemon is not running");
        return Ok(());
    };

    if !is_process_running(pid) {
        println!("Daemon is not running (stale PID file)");
        fs::remove_file(&pid_file)?;
        return Ok(());
    }

    println!("Stopping daemon (PID: {})...", pid);
    send_terminate(pid)?;

    // Up to the shutdown timeout plus a margin for the final saves
    let wait = config
        .daemon
        .shutdown_timeout()
        .unwrap_or(std::time::Duration::from_secs(5))
        + std::time::Duration::from_secs(2);
    let deadline = std::time::Instant::now() + wait;
    while is_process_running(pid) && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    if is_process_running(pid) {
        anyhow::bail!("Failed to stop daemon (PID: {})", pid);
    }

    println!("Daemon stopped");
    fs::remove_file(&pid_file).ok();

    Ok(())
}

/// Fork and daemonize BEFORE starting the Tokio runtime.
#[cfg(unix)]
pub fn daemonize_and_run(config: Config, verbose: bool) -> Result<()> {
    let pid_file = config.paths.pid_file();
    ensure_not_running(&pid_file)?;

    let log_file = get_log_file(&config.paths.logs_dir(), config.logging.retention_days)?;

    println!("Starting zonewall daemon in background...");
    println!("  PID file: {}", pid_file.display());
    println!("  Log file: {}", log_file.display());
    println!("  Socket:   {}", config.socket_path().display());
    println!("\nUse 'zonewall daemon status' to check status");
    println!("Use 'zonewall daemon stop' to stop\n");

    // Append to keep earlier logs from the same day
    let stdout = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;
    let stderr = stdout.try_clone()?;

    let daemonize = Daemonize::new()
        .pid_file(&pid_file)
        .working_directory(std::env::current_dir()?)
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => {
            // Child process: safe to start Tokio
            super::init_logging(verbose, &config.logging.level, false);
            crate::daemon::install_panic_hook(config.paths.crash_log());
            let result = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(crate::daemon::run(config));
            fs::remove_file(&pid_file).ok();
            result
        }
        Err(e) => anyhow::bail!("Failed to daemonize: {}", e),
    }
}

#[derive(Args)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommands,
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Restart the daemon (stop then start)
    Restart {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Show daemon status
    Status,
}

pub async fn run(args: DaemonArgs, config: Config) -> Result<()> {
    match args.command {
        DaemonCommands::Start { foreground } => start_daemon(foreground, config).await,
        DaemonCommands::Stop => {
            tokio::task::spawn_blocking(move || stop_sync(&config)).await?
        }
        DaemonCommands::Restart { foreground } => {
            let stop_config = config.clone();
            tokio::task::spawn_blocking(move || stop_sync(&stop_config)).await??;
            println!();
            start_daemon(foreground, config).await
        }
        DaemonCommands::Status => show_status(&config).await,
    }
}

async fn start_daemon(foreground: bool, config: Config) -> Result<()> {
    let pid_file = config.paths.pid_file();
    ensure_not_running(&pid_file)?;

    // Background mode on Unix is handled by daemonize_and_run() before Tokio starts
    #[cfg(unix)]
    if !foreground {
        anyhow::bail!("Background mode should be handled before Tokio starts");
    }

    #[cfg(not(unix))]
    if !foreground {
        println!(
            "Note: Background daemonization not supported on this platform. Running in foreground."
        );
    }

    println!("Starting zonewall daemon in foreground...");
    println!("  Socket: {}", config.socket_path().display());

    fs::write(&pid_file, std::process::id().to_string())?;
    crate::daemon::install_panic_hook(config.paths.crash_log());

    let result = crate::daemon::run(config).await;

    println!("\nShutting down...");
    fs::remove_file(&pid_file).ok();
    result
}

async fn show_status(config: &Config) -> Result<()> {
    let pid_file = config.paths.pid_file();
    let pid = read_pid(&pid_file)?.filter(|pid| is_process_running(*pid));

    println!("zonewall Daemon Status");
    println!("----------------------");
    println!("Running: {}", if pid.is_some() { "yes" } else { "no" });
    if let Some(pid) = pid {
        println!("PID: {}", pid);
    }

    println!("\nConfiguration:");
    println!("  Socket: {}", config.socket_path().display());
    println!("  Tick interval: {}", config.daemon.tick_interval);
    println!("  Inactivity lock: {}", config.daemon.inactivity_lock);
    println!("  Hosts file: {}", config.protection.hosts_file);

    Ok(())
}

fn ensure_not_running(pid_file: &Path) -> Result<()> {
    if let Some(pid) = read_pid(pid_file)? {
        if is_process_running(pid) {
            anyhow::bail!("Daemon already running (PID: {})", pid);
        }
        fs::remove_file(pid_file)?;
    }
    Ok(())
}

fn read_pid(pid_file: &Path) -> Result<Option<i32>> {
    if !pid_file.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(pid_file)?;
    Ok(content.trim().parse().ok())
}

fn get_log_file(logs_dir: &Path, retention_days: u32) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir)?;

    if retention_days > 0 {
        prune_old_logs(logs_dir, retention_days as i64);
    }

    let date = chrono::Local::now().format("%Y-%m-%d");
    Ok(logs_dir.join(format!("{}{}.log", LOG_PREFIX, date)))
}

/// Prune log files older than `keep_days` days
fn prune_old_logs(logs_dir: &Path, keep_days: i64) {
    let cutoff = chrono::Local::now() - chrono::Duration::days(keep_days);
    let cutoff_date = cutoff.format("%Y-%m-%d").to_string();

    if let Ok(entries) = fs::read_dir(logs_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            if let Some(date_part) = name_str
                .strip_prefix(LOG_PREFIX)
                .and_then(|s| s.strip_suffix(".log"))
                && date_part < cutoff_date.as_str()
            {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: i32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| anyhow::anyhow!("Failed to signal PID {}: {}", pid, e))
}

#[cfg(windows)]
fn send_terminate(pid: i32) -> Result<()> {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status()?;
    Ok(())
}

fn is_process_running(pid: i32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), None).is_ok()
    }

    #[cfg(windows)]
    {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("daemon.pid");
        assert_eq!(read_pid(&pid_file).unwrap(), None);

        fs::write(&pid_file, "1234\n").unwrap();
        assert_eq!(read_pid(&pid_file).unwrap(), Some(1234));

        fs::write(&pid_file, "garbage").unwrap();
        assert_eq!(read_pid(&pid_file).unwrap(), None);
    }

    #[test]
    fn own_process_counts_as_running() {
        assert!(is_process_running(std::process::id() as i32));
    }

    #[test]
    fn log_file_is_date_named() {
        let tmp = tempfile::tempdir().unwrap();
        let log = get_log_file(&tmp.path().join("logs"), 0).unwrap();
        let name = log.file_name().unwrap().to_string_lossy().to_string();
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        assert_eq!(name, format!("zonewall-{}.log", today));
    }

    #[test]
    fn retention_prunes_only_old_daemon_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path();
        fs::write(logs.join("zonewall-2000-01-01.log"), "").unwrap();
        fs::write(logs.join("other-2000-01-01.log"), "").unwrap();
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        fs::write(logs.join(format!("zonewall-{}.log", today)), "").unwrap();

        prune_old_logs(logs, 7);

        assert!(!logs.join("zonewall-2000-01-01.log").exists());
        assert!(logs.join("other-2000-01-01.log").exists());
        assert!(logs.join(format!("zonewall-{}.log", today)).exists());
    }
}
