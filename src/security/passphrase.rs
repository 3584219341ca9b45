//! Passphrase storage.
//!
//! Only the SHA-256 digest of the secret is kept, hex-encoded, in a single
//! file readable by the owner alone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::store::{StoreError, write_private};

#[derive(Debug, Clone)]
pub struct PassphraseStore {
    path: PathBuf,
}

impl PassphraseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_secret(&self) -> bool {
        self.stored_digest().is_some()
    }

    /// Replace the passphrase. An empty secret removes it.
    pub fn set(&self, secret: &str) -> Result<(), StoreError> {
        if secret.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                }),
            };
        }

        write_private(&self.path, digest(secret).as_bytes())
    }

    /// Check `secret` against the stored digest. With no passphrase set,
    /// any secret unlocks.
    pub fn verify(&self, secret: &str) -> bool {
        match self.stored_digest() {
            Some(stored) => stored == digest(secret),
            None => true,
        }
    }

    fn stored_digest(&self) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        let trimmed = content.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

fn digest(secret: &str) -> String {
    hex_encode(&Sha256::digest(secret.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_verify() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PassphraseStore::new(tmp.path().join("passphrase"));

        assert!(!store.has_secret());
        assert!(store.verify("anything"));

        store.set("hunter2").unwrap();
        assert!(store.has_secret());
        assert!(store.verify("hunter2"));
        assert!(!store.verify("hunter3"));
        assert!(!store.verify(""));
    }

    #[test]
    fn only_digest_is_stored() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PassphraseStore::new(tmp.path().join("passphrase"));
        store.set("hunter2").unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(!content.contains("hunter2"));
        assert_eq!(content.len(), 64);
        assert!(content.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_secret_clears_passphrase() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PassphraseStore::new(tmp.path().join("passphrase"));
        store.set("s3cret").unwrap();
        store.set("").unwrap();
        assert!(!store.has_secret());
        assert!(!store.path().exists());

        store.set("").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn passphrase_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = PassphraseStore::new(tmp.path().join("passphrase"));
        store.set("s3cret").unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
