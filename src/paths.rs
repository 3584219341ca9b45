//! XDG-style directory resolution for the daemon and its controller.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. zonewall-specific env var (ZONEWALL_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! Relative paths from env vars are ignored.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::getuid;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "zonewall";

/// Resolved directories. Created once at startup and carried by `Config`.
#[derive(Debug, Clone)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    /// Zones, machine settings, profile catalog, passphrase
    pub data_dir: PathBuf,

    /// Logs and crash log
    pub state_dir: PathBuf,

    /// PID file and socket. None if no runtime directory is available.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "ZONEWALL_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });

        let data_dir = env_or(&env_fn, "ZONEWALL_DATA_DIR", || {
            strategy.data_dir().join(APP_DIR)
        });

        let state_dir = env_or(&env_fn, "ZONEWALL_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join(APP_DIR)
        });

        let runtime_dir = resolve_runtime_dir(&env_fn);

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
            runtime_dir,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn zones_dir(&self) -> PathBuf {
        self.data_dir.join("zones")
    }

    pub fn machine_settings(&self) -> PathBuf {
        self.data_dir.join("machine.json")
    }

    pub fn profile_catalog(&self) -> PathBuf {
        self.data_dir.join("profiles.json")
    }

    pub fn passphrase_file(&self) -> PathBuf {
        self.data_dir.join("passphrase")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn crash_log(&self) -> PathBuf {
        self.state_dir.join("crash.log")
    }

    fn runtime_or_state(&self) -> &Path {
        self.runtime_dir.as_deref().unwrap_or(&self.state_dir)
    }

    /// Default IPC socket (in runtime_dir, falls back to state_dir)
    pub fn socket(&self) -> PathBuf {
        self.runtime_or_state().join("zonewall.sock")
    }

    /// PID file (in runtime_dir, falls back to state_dir)
    pub fn pid_file(&self) -> PathBuf {
        self.runtime_or_state().join("daemon.pid")
    }

    /// Create all directories with mode 0700.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }

        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }

        Ok(())
    }

    /// All directories under one root, for tests.
    #[cfg(test)]
    pub(crate) fn rooted(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            state_dir: root.join("state"),
            runtime_dir: Some(root.join("run")),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                data_dir: home.join(".local").join("share").join(APP_DIR),
                state_dir: home.join(".local").join("state").join(APP_DIR),
                runtime_dir: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| PathBuf::from(shellexpand::tilde(&v).to_string()))
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join(APP_DIR));
        }
    }

    // $TMPDIR/zonewall-$UID
    #[cfg(unix)]
    {
        let uid = unsafe { getuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        Some(PathBuf::from(tmpdir).join(format!("{}-{}", APP_DIR, uid)))
    }

    #[cfg(not(unix))]
    {
        env_fn("TEMP").ok().map(|t| {
            let user = env_fn("USERNAME").unwrap_or_else(|_| "user".into());
            PathBuf::from(t).join(format!("{}-{}", APP_DIR, user))
        })
    }
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_end_in_app_dir() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(paths.config_dir.ends_with("zonewall"), "{:?}", paths.config_dir);
        assert!(paths.data_dir.ends_with("zonewall"), "{:?}", paths.data_dir);
        assert!(paths.state_dir.ends_with("zonewall"), "{:?}", paths.state_dir);
    }

    #[test]
    fn env_vars_override_xdg() {
        let env = HashMap::from([
            ("ZONEWALL_CONFIG_DIR", "/custom/config"),
            ("ZONEWALL_DATA_DIR", "/custom/data"),
            ("ZONEWALL_STATE_DIR", "/custom/state"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ]);

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(
            paths.socket(),
            PathBuf::from("/run/user/1000/zonewall/zonewall.sock")
        );
    }

    #[test]
    fn relative_and_empty_overrides_are_ignored() {
        let env = HashMap::from([
            ("ZONEWALL_CONFIG_DIR", "relative/path"),
            ("ZONEWALL_DATA_DIR", ""),
        ]);

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert_ne!(paths.config_dir, PathBuf::from("relative/path"));
        assert!(paths.data_dir.ends_with("zonewall"));
    }

    #[test]
    fn persisted_files_live_under_data_dir() {
        let env = HashMap::from([("ZONEWALL_DATA_DIR", "/d"), ("ZONEWALL_STATE_DIR", "/s")]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();

        assert_eq!(paths.zones_dir(), PathBuf::from("/d/zones"));
        assert_eq!(paths.machine_settings(), PathBuf::from("/d/machine.json"));
        assert_eq!(paths.profile_catalog(), PathBuf::from("/d/profiles.json"));
        assert_eq!(paths.passphrase_file(), PathBuf::from("/d/passphrase"));
        assert_eq!(paths.logs_dir(), PathBuf::from("/s/logs"));
        assert_eq!(paths.crash_log(), PathBuf::from("/s/crash.log"));
        assert!(paths.config_file().ends_with("config.toml"));
        assert!(paths.pid_file().ends_with("daemon.pid"));
    }

    #[test]
    fn pid_and_socket_fall_back_to_state_dir() {
        let paths = Paths {
            config_dir: PathBuf::from("/c"),
            data_dir: PathBuf::from("/d"),
            state_dir: PathBuf::from("/s"),
            runtime_dir: None,
        };
        assert_eq!(paths.pid_file(), PathBuf::from("/s/daemon.pid"));
        assert_eq!(paths.socket(), PathBuf::from("/s/zonewall.sock"));
    }

    #[test]
    fn ensure_dirs_creates_owner_only_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: tmp.path().join("c"),
            data_dir: tmp.path().join("d"),
            state_dir: tmp.path().join("s"),
            runtime_dir: Some(tmp.path().join("r")),
        };
        paths.ensure_dirs().unwrap();

        for dir in ["c", "d", "s", "r"] {
            assert!(tmp.path().join(dir).is_dir());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.data_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
