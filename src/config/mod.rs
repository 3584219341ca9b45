use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved directories (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub protection: ProtectionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How often the expiry check runs
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    /// Controller inactivity before auto-lock ("0" disables)
    #[serde(default = "default_inactivity_lock")]
    pub inactivity_lock: String,

    /// How long shutdown waits for the authority to drain
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Socket path override; defaults to <runtime>/zonewall.sock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(default = "default_hosts_file")]
    pub hosts_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Days to keep log files (0 = keep forever)
    #[serde(default)]
    pub retention_days: u32,
}

fn default_tick_interval() -> String {
    "60s".to_string()
}
fn default_inactivity_lock() -> String {
    "10m".to_string()
}
fn default_shutdown_timeout() -> String {
    "5s".to_string()
}
fn default_hosts_file() -> String {
    "/etc/hosts".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            inactivity_lock: default_inactivity_lock(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            hosts_file: default_hosts_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            retention_days: 0,
        }
    }
}

impl DaemonConfig {
    pub fn tick_interval(&self) -> Result<Duration> {
        let interval = parse_duration(&self.tick_interval)
            .map_err(|e| anyhow::anyhow!("Invalid daemon.tick_interval: {}", e))?;
        if interval.is_zero() {
            anyhow::bail!("Invalid daemon.tick_interval: must be greater than zero");
        }
        Ok(interval)
    }

    pub fn inactivity_lock(&self) -> Result<Duration> {
        parse_duration(&self.inactivity_lock)
            .map_err(|e| anyhow::anyhow!("Invalid daemon.inactivity_lock: {}", e))
    }

    pub fn shutdown_timeout(&self) -> Result<Duration> {
        parse_duration(&self.shutdown_timeout)
            .map_err(|e| anyhow::anyhow!("Invalid daemon.shutdown_timeout: {}", e))
    }
}

impl Config {
    /// Load from the resolved config path, creating it from the template on
    /// first run.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();
        Self::load_from(&path, paths)
    }

    /// Load from `--config` if given, else from the resolved path.
    pub fn load_with(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => {
                let paths = Paths::resolve()?;
                paths.ensure_dirs()?;
                let file = PathBuf::from(shellexpand::tilde(p).to_string());
                Self::load_from(&file, paths)
            }
            None => Self::load(),
        }
    }

    /// Load from an explicit file.
    pub fn load_from(path: &Path, paths: Paths) -> Result<Self> {
        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            write_template(path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.paths = paths;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.ipc.socket {
            Some(socket) if !socket.trim().is_empty() => {
                PathBuf::from(shellexpand::tilde(socket.trim()).to_string())
            }
            _ => self.paths.socket(),
        }
    }

    pub fn hosts_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.protection.hosts_file).to_string())
    }
}

/// Write the commented default config to `path`.
pub fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    eprintln!("Created default config at {}", path.display());
    Ok(())
}

/// Parse a compact duration: `30s`, `10m`, `1h`, `2d`. A bare number is
/// seconds, so `"0"` is zero.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (digits, multiplier) = match s.char_indices().last() {
        Some((i, 's')) => (&s[..i], 1),
        Some((i, 'm')) => (&s[..i], 60),
        Some((i, 'h')) => (&s[..i], 60 * 60),
        Some((i, 'd')) => (&s[..i], 24 * 60 * 60),
        _ => (s, 1),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {}", s))?;
    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration out of range: {}", s))
}

/// Default config template with comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# zonewall configuration
# Auto-created on first run. Edit as needed.

[daemon]
# Expiry check interval
tick_interval = "60s"
# Lock privileged commands after this much controller inactivity ("0" disables)
inactivity_lock = "10m"
# Time allowed for in-flight requests at shutdown
shutdown_timeout = "5s"

[ipc]
# Default: $XDG_RUNTIME_DIR/zonewall/zonewall.sock
# socket = "/run/zonewall/zonewall.sock"

[protection]
# Guarded while the machine setting lock_hosts_file is on
hosts_file = "/etc/hosts"

[logging]
level = "info"
# Days to keep daemon log files (0 = keep forever)
retention_days = 0
"#;
