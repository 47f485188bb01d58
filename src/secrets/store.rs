//! Encrypted file-backed Secret Store
//!
//! One `secrets.json` per config directory. Record names are visible, values
//! are sealed. Writes replace the file through an atomic rename.

use super::crypto::{generate_salt, MasterKey};
use crate::error::StorageError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// File name of the store inside the config directory
pub const STORE_FILE: &str = "secrets.json";

const FORMAT_VERSION: u32 = 1;
const CHECK_SERVICE: &str = "toolhost";
const CHECK_KEY: &str = "key_check";
const CHECK_PLAINTEXT: &[u8] = b"toolhost-key-check";

/// Writers to the same directory inside this process share one lock
static DIR_LOCKS: Lazy<DashMap<PathBuf, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

/// Path of the store file for a config directory
pub fn store_path(config_dir: &Path) -> PathBuf {
    config_dir.join(STORE_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    salt: String,
    check: String,
    #[serde(default)]
    records: BTreeMap<String, BTreeMap<String, SealedRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedRecord {
    sealed: String,
    #[serde(default)]
    secret: bool,
}

/// A decrypted record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretValue {
    pub value: String,
    /// Tagged for redaction
    pub secret: bool,
}

/// Encrypted key-value store keyed by `(service, key)`
pub struct SecretStore {
    dir: PathBuf,
    path: PathBuf,
    key: MasterKey,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").field("path", &self.path).finish()
    }
}

impl SecretStore {
    /// Bind a store to a config directory
    pub fn open(config_dir: &Path, key: MasterKey) -> Result<Self, StorageError> {
        create_private_dir(config_dir)?;
        let dir = fs::canonicalize(config_dir)?;
        let lock = DIR_LOCKS
            .entry(dir.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let store = Self {
            path: store_path(&dir),
            dir,
            key,
            lock,
        };

        // Fail early on a foreign master key
        if let Some(file) = store.read_file()? {
            store.verify_key(&file)?;
        }

        debug!("Opened secret store at {:?}", store.path);
        Ok(store)
    }

    /// Directory this store is bound to
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read a value; missing records are `None`
    pub fn get(&self, service: &str, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.get_record(service, key)?.map(|r| r.value))
    }

    /// Read a value with its redaction tag
    pub fn get_record(
        &self,
        service: &str,
        key: &str,
    ) -> Result<Option<SecretValue>, StorageError> {
        validate_name(service)?;
        validate_name(key)?;

        let Some(file) = self.read_file()? else {
            return Ok(None);
        };
        let Some(record) = file.records.get(service).and_then(|s| s.get(key)) else {
            return Ok(None);
        };

        let salt = decode_salt(&file)?;
        let corrupt = || StorageError::Corrupt {
            service: service.to_string(),
            key: key.to_string(),
        };
        let plaintext = self
            .key
            .open(&salt, service, key, &record.sealed)
            .ok_or_else(corrupt)?;
        let value = String::from_utf8(plaintext.to_vec()).map_err(|_| corrupt())?;

        Ok(Some(SecretValue {
            value,
            secret: record.secret,
        }))
    }

    /// Write a value, replacing any previous one
    pub fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        secret: bool,
    ) -> Result<(), StorageError> {
        self.set_many(service, &[(key, value, secret)])
    }

    /// Write several values of one service in a single atomic replace
    pub fn set_many(
        &self,
        service: &str,
        entries: &[(&str, &str, bool)],
    ) -> Result<(), StorageError> {
        validate_name(service)?;
        for (key, _, _) in entries {
            validate_name(key)?;
        }

        self.modify(|file, store| {
            let salt = decode_salt(file)?;
            let mut sealed = Vec::with_capacity(entries.len());
            for (key, value, secret) in entries {
                sealed.push((
                    key.to_string(),
                    SealedRecord {
                        sealed: store.key.seal(&salt, service, key, value.as_bytes())?,
                        secret: *secret,
                    },
                ));
            }
            let records = file.records.entry(service.to_string()).or_default();
            records.extend(sealed);
            Ok(true)
        })
    }

    /// Delete a value; returns whether it existed
    pub fn delete(&self, service: &str, key: &str) -> Result<bool, StorageError> {
        validate_name(service)?;
        validate_name(key)?;

        let mut existed = false;
        self.modify(|file, _| {
            if let Some(records) = file.records.get_mut(service) {
                existed = records.remove(key).is_some();
                if records.is_empty() {
                    file.records.remove(service);
                }
            }
            Ok(existed)
        })?;
        Ok(existed)
    }

    /// Keys stored under a service, never values
    pub fn list(&self, service: &str) -> Result<Vec<String>, StorageError> {
        validate_name(service)?;
        Ok(self
            .read_file()?
            .and_then(|mut f| f.records.remove(service))
            .map(|records| records.into_keys().collect())
            .unwrap_or_default())
    }

    /// Services with at least one record
    pub fn services(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .read_file()?
            .map(|f| f.records.into_keys().collect())
            .unwrap_or_default())
    }

    /// Read-modify-write under the directory lock
    fn modify<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut StoreFile, &Self) -> Result<bool, StorageError>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = match self.read_file()? {
            Some(file) => {
                self.verify_key(&file)?;
                file
            }
            None => self.new_file()?,
        };

        if f(&mut file, self)? {
            self.write_file(&file)?;
        }
        Ok(())
    }

    fn new_file(&self) -> Result<StoreFile, StorageError> {
        let salt = generate_salt();
        let check = self.key.seal(&salt, CHECK_SERVICE, CHECK_KEY, CHECK_PLAINTEXT)?;
        Ok(StoreFile {
            version: FORMAT_VERSION,
            salt: STANDARD.encode(salt),
            check,
            records: BTreeMap::new(),
        })
    }

    fn verify_key(&self, file: &StoreFile) -> Result<(), StorageError> {
        let salt = decode_salt(file)?;
        match self.key.open(&salt, CHECK_SERVICE, CHECK_KEY, &file.check) {
            Some(plaintext) if plaintext.as_slice() == CHECK_PLAINTEXT => Ok(()),
            _ => Err(StorageError::WrongKey),
        }
    }

    fn read_file(&self) -> Result<Option<StoreFile>, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: StoreFile = serde_json::from_str(&contents).map_err(|e| {
            warn!("Secret store {:?} failed to parse", self.path);
            StorageError::CorruptFile(e.to_string())
        })?;
        if file.version != FORMAT_VERSION {
            return Err(StorageError::CorruptFile(format!(
                "unsupported version {}",
                file.version
            )));
        }
        Ok(Some(file))
    }

    fn write_file(&self, file: &StoreFile) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(file)
            .map_err(|e| StorageError::Serialize(e.to_string()))?;

        // NamedTempFile is created 0600 in the same directory
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

fn decode_salt(file: &StoreFile) -> Result<Vec<u8>, StorageError> {
    STANDARD
        .decode(&file.salt)
        .map_err(|e| StorageError::CorruptFile(format!("invalid salt: {}", e)))
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_control) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn create_private_dir(dir: &Path) -> Result<(), StorageError> {
    if dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
