use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{VpnError, VpnResult};

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// Opaque store of symmetric keys addressed by `(alias, user_id)`
pub trait KeyVault: Send + Sync {
    fn key_exists(&self, alias: &str, user_id: i32) -> VpnResult<bool>;

    /// Create the key for `(alias, user_id)`. Creating an existing key is an error.
    fn generate_key(&self, alias: &str, user_id: i32) -> VpnResult<()>;

    /// Create the key unless it exists, as one step. Returns whether a key
    /// was created.
    fn ensure_key(&self, alias: &str, user_id: i32) -> VpnResult<bool>;

    fn load_key(&self, alias: &str, user_id: i32) -> VpnResult<[u8; KEY_LEN]>;
}

/// Keys persisted as 0600 files, one per `(alias, user_id)`
pub struct FileKeyVault {
    key_dir: PathBuf,
    // Held across the exists check and key creation
    lock: Mutex<()>,
}

impl FileKeyVault {
    pub fn new<P: AsRef<Path>>(key_dir: P) -> Self {
        Self {
            key_dir: key_dir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn key_path(&self, alias: &str, user_id: i32) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(alias.as_bytes());
        hasher.update(b"/");
        hasher.update(user_id.to_string().as_bytes());
        self.key_dir.join(format!("{}.key", hex::encode(&hasher.finalize()[..16])))
    }

    /// Write a fresh key to a temporary sibling and link it into place, so
    /// `path` never exists half written. Fails with `AlreadyExists` if taken.
    fn write_new_key(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.key_dir)?;
        let tmp = path.with_extension(format!("tmp.{}", hex::encode(rand::random::<[u8; 8]>())));
        let key: [u8; KEY_LEN] = rand::random();
        let written = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .and_then(|mut file| file.write_all(&key))
            .and_then(|()| fs::hard_link(&tmp, path));
        let _ = fs::remove_file(&tmp);
        written
    }
}

impl KeyVault for FileKeyVault {
    fn key_exists(&self, alias: &str, user_id: i32) -> VpnResult<bool> {
        Ok(self.key_path(alias, user_id).is_file())
    }

    fn generate_key(&self, alias: &str, user_id: i32) -> VpnResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.key_path(alias, user_id);
        match self.write_new_key(&path) {
            Ok(()) => {
                info!("Generated credential key for user {}", user_id);
                Ok(())
            }
            Err(e) => Err(VpnError::Crypto(format!("Failed to create key {:?}: {}", path, e))),
        }
    }

    fn ensure_key(&self, alias: &str, user_id: i32) -> VpnResult<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.key_path(alias, user_id);
        if path.is_file() {
            return Ok(false);
        }
        match self.write_new_key(&path) {
            Ok(()) => {
                info!("Generated credential key for user {}", user_id);
                Ok(true)
            }
            // another process created it first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(VpnError::Crypto(format!("Failed to create key {:?}: {}", path, e))),
        }
    }

    fn load_key(&self, alias: &str, user_id: i32) -> VpnResult<[u8; KEY_LEN]> {
        let path = self.key_path(alias, user_id);
        let data = fs::read(&path)
            .map_err(|e| VpnError::Crypto(format!("Key for user {} unavailable: {}", user_id, e)))?;

        let key: [u8; KEY_LEN] = data
            .as_slice()
            .try_into()
            .map_err(|_| VpnError::Crypto(format!("Key file {:?} has invalid length {}", path, data.len())))?;
        debug!("Loaded credential key for user {}", user_id);
        Ok(key)
    }
}

/// Process-local vault, keys vanish with the process
#[derive(Default)]
pub struct MemoryKeyVault {
    keys: Mutex<HashMap<(String, i32), [u8; KEY_LEN]>>,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyVault for MemoryKeyVault {
    fn key_exists(&self, alias: &str, user_id: i32) -> VpnResult<bool> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.contains_key(&(alias.to_string(), user_id)))
    }

    fn generate_key(&self, alias: &str, user_id: i32) -> VpnResult<()> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (alias.to_string(), user_id);
        if keys.contains_key(&slot) {
            return Err(VpnError::Crypto(format!("Key {} for user {} already exists", alias, user_id)));
        }
        keys.insert(slot, rand::random());
        Ok(())
    }

    fn ensure_key(&self, alias: &str, user_id: i32) -> VpnResult<bool> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (alias.to_string(), user_id);
        if keys.contains_key(&slot) {
            return Ok(false);
        }
        keys.insert(slot, rand::random());
        Ok(true)
    }

    fn load_key(&self, alias: &str, user_id: i32) -> VpnResult<[u8; KEY_LEN]> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(&(alias.to_string(), user_id))
            .copied()
            .ok_or_else(|| VpnError::Crypto(format!("Key {} for user {} does not exist", alias, user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_file_vault_generate_and_load() {
        let dir = TempDir::new().unwrap();
        let vault = FileKeyVault::new(dir.path().join("keys"));

        assert!(!vault.key_exists("alias", 100).unwrap());
        vault.generate_key("alias", 100).unwrap();
        assert!(vault.key_exists("alias", 100).unwrap());
        assert!(!vault.key_exists("alias", 101).unwrap());

        let first = vault.load_key("alias", 100).unwrap();
        let second = vault.load_key("alias", 100).unwrap();
        assert_eq!(first, second);

        let path = vault.key_path("alias", 100);
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_vault_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let vault = FileKeyVault::new(dir.path());
        vault.generate_key("alias", 0).unwrap();
        let key = vault.load_key("alias", 0).unwrap();

        assert!(vault.generate_key("alias", 0).is_err());
        assert_eq!(vault.load_key("alias", 0).unwrap(), key);
    }

    #[test]
    fn test_ensure_key_from_many_threads() {
        let dir = TempDir::new().unwrap();
        let vault = std::sync::Arc::new(FileKeyVault::new(dir.path().join("keys")));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vault = vault.clone();
                std::thread::spawn(move || vault.ensure_key("alias", 7))
            })
            .collect();
        let created: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
        assert_eq!(created.iter().filter(|c| **c).count(), 1);
        assert!(vault.load_key("alias", 7).is_ok());
        // only the key itself is left behind
        assert_eq!(fs::read_dir(dir.path().join("keys")).unwrap().count(), 1);
    }

    #[test]
    fn test_ensure_key_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let first = FileKeyVault::new(dir.path());
        let second = FileKeyVault::new(dir.path());
        assert!(first.ensure_key("alias", 3).unwrap());
        assert!(!second.ensure_key("alias", 3).unwrap());
        assert_eq!(first.load_key("alias", 3).unwrap(), second.load_key("alias", 3).unwrap());
    }

    #[test]
    fn test_memory_vault_scoped_by_user() {
        let vault = MemoryKeyVault::new();
        vault.generate_key("alias", 1).unwrap();
        vault.generate_key("alias", 2).unwrap();
        assert_ne!(vault.load_key("alias", 1).unwrap(), vault.load_key("alias", 2).unwrap());
        assert!(vault.load_key("other", 1).is_err());
        assert!(!vault.ensure_key("alias", 1).unwrap());
        assert!(vault.ensure_key("other", 1).unwrap());
    }
}
