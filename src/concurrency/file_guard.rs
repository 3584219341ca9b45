//! Holds protected files open under shared advisory locks (fs2 flock).
//!
//! While the daemon runs, other processes can read the profile catalog,
//! the passphrase file and (optionally) the hosts file, but cannot take an
//! exclusive lock on them. The daemon releases a file before writing it
//! and re-protects it afterwards.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Set of shared locks, released on drop.
#[derive(Default)]
pub struct FileGuard {
    held: HashMap<PathBuf, File>,
}

impl FileGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a shared lock on `path`.
    ///
    /// Returns `Ok(false)` if the file does not exist; `Ok(true)` if it is
    /// now (or already was) protected.
    pub fn protect(&mut self, path: &Path) -> Result<bool> {
        if self.held.contains_key(path) {
            return Ok(true);
        }
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()));
            }
        };
        file.lock_shared()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        tracing::debug!("Protecting {}", path.display());
        self.held.insert(path.to_path_buf(), file);
        Ok(true)
    }

    /// Drop the lock on `path`. Returns `true` if it was held.
    pub fn release(&mut self, path: &Path) -> bool {
        match self.held.remove(path) {
            Some(file) => {
                let _ = file.unlock();
                tracing::debug!("Released {}", path.display());
                true
            }
            None => false,
        }
    }

    pub fn release_all(&mut self) {
        for (_, file) in self.held.drain() {
            let _ = file.unlock();
        }
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        self.held.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        self.release_all();
    }
}
