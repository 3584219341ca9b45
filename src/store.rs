//! Persistence of zones and machine settings under the data directory.
//!
//! Layout:
//! - `zones/<ZoneName>.json`
//! - `machine.json`

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::policy::{MachineSettings, Zone};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid zone name '{0}'")]
    InvalidZoneName(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `content` to `path` via a unique temp file and a rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    write_replacing(path, content, false)
}

/// Like [`write_atomic`], but the file is owner-only (0600 on Unix) from
/// the moment it is created.
pub fn write_private(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    write_replacing(path, content, true)
}

fn write_replacing(path: &Path, content: &[u8], owner_only: bool) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp_path = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().as_simple()
    ));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if owner_only {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = owner_only;

    let written = options
        .open(&tmp_path)
        .and_then(|mut file| file.write_all(content));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(&tmp_path, e));
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    root: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    pub fn zones_dir(&self) -> PathBuf {
        self.root.join("zones")
    }

    pub fn zone_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidZoneName(name.to_string()));
        }
        Ok(self.zones_dir().join(format!("{}.json", name)))
    }

    pub fn machine_path(&self) -> PathBuf {
        self.root.join("machine.json")
    }

    /// Load the zone `name`. A missing file yields an empty zone.
    pub fn load_zone(&self, name: &str) -> Result<Zone, StoreError> {
        let path = self.zone_path(name)?;
        let mut zone = read_json::<Zone>(&path)?.unwrap_or_else(|| Zone::new(name));
        zone.name = name.to_string();
        zone.normalize();
        Ok(zone)
    }

    pub fn save_zone(&self, zone: &Zone) -> Result<(), StoreError> {
        let path = self.zone_path(&zone.name)?;
        write_json(&path, zone)?;
        debug!("Saved zone '{}' to {}", zone.name, path.display());
        Ok(())
    }

    pub fn load_machine(&self) -> Result<MachineSettings, StoreError> {
        Ok(read_json(&self.machine_path())?.unwrap_or_default())
    }

    pub fn save_machine(&self, settings: &MachineSettings) -> Result<(), StoreError> {
        write_json(&self.machine_path(), settings)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, content.as_bytes())
}
