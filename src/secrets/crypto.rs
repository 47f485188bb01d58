//! Master key resolution and per-record sealing
//!
//! Records are sealed with AES-256-GCM under a key derived by HKDF-SHA256
//! from the master key, the store salt and the record coordinates. The
//! coordinates are also bound as associated data.

use crate::config::{MasterKeySource, SecretsConfig};
use crate::error::StorageError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Account name for the master key in the OS keyring
const MASTER_KEY_ACCOUNT: &str = "master_key";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
pub(crate) const SALT_LEN: usize = 16;

/// The process-local key every record is derived from
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    /// Generate a random master key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a hex-encoded key
    pub fn from_hex(hex_str: &str) -> Result<Self, StorageError> {
        let decoded = Zeroizing::new(
            hex::decode(hex_str.trim())
                .map_err(|e| StorageError::MasterKey(format!("invalid hex: {}", e)))?,
        );
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            StorageError::MasterKey(format!("expected {} bytes, got {}", KEY_LEN, decoded.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.0[..]))
    }

    /// Resolve the master key according to configuration
    pub fn resolve(config: &SecretsConfig) -> Result<Self, StorageError> {
        match config.master_key {
            MasterKeySource::Env => Self::from_env(&config.master_key_env)?.ok_or_else(|| {
                StorageError::MasterKey(format!("{} is not set", config.master_key_env))
            }),
            MasterKeySource::Keyring => Self::from_keyring(&config.keyring_service),
            MasterKeySource::File => Self::from_key_file(&config.key_file),
            MasterKeySource::Auto => {
                if let Some(key) = Self::from_env(&config.master_key_env)? {
                    debug!("Using master key from {}", config.master_key_env);
                    return Ok(key);
                }
                match Self::from_keyring(&config.keyring_service) {
                    Ok(key) => Ok(key),
                    Err(e) => {
                        warn!("OS keyring unavailable ({}), using key file", e);
                        Self::from_key_file(&config.key_file)
                    }
                }
            }
        }
    }

    fn from_env(var: &str) -> Result<Option<Self>, StorageError> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Self::from_hex(&value).map(Some),
            _ => Ok(None),
        }
    }

    fn from_keyring(service: &str) -> Result<Self, StorageError> {
        let entry = keyring::Entry::new(service, MASTER_KEY_ACCOUNT).map_err(|e| {
            StorageError::MasterKey(format!("Failed to create keyring entry: {}", e))
        })?;

        match entry.get_password() {
            Ok(hex_key) => Self::from_hex(&hex_key),
            Err(keyring::Error::NoEntry) => {
                let key = Self::generate();
                entry.set_password(&key.to_hex()).map_err(|e| {
                    StorageError::MasterKey(format!("Failed to store master key: {}", e))
                })?;
                info!("Generated new master key in OS keyring");
                Ok(key)
            }
            Err(e) => Err(StorageError::MasterKey(format!(
                "Failed to read master key: {}",
                e
            ))),
        }
    }

    fn from_key_file(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            let contents = Zeroizing::new(fs::read_to_string(path)?);
            return Self::from_hex(&contents);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let key = Self::generate();
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(key.to_hex().as_bytes())?;
        file.sync_all()?;
        info!("Generated new master key file at {:?}", path);
        Ok(key)
    }

    fn record_key(
        &self,
        salt: &[u8],
        service: &str,
        key: &str,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, StorageError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.0[..]);
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(record_info(service, key).as_bytes(), &mut okm[..])
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(okm)
    }

    /// Seal a record value; output is base64(nonce || ciphertext)
    pub(crate) fn seal(
        &self,
        salt: &[u8],
        service: &str,
        key: &str,
        plaintext: &[u8],
    ) -> Result<String, StorageError> {
        let record_key = self.record_key(salt, service, key)?;
        let cipher = Aes256Gcm::new_from_slice(&record_key[..])
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aad = record_info(service, key);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Open a sealed record; `None` when it fails to authenticate
    pub(crate) fn open(
        &self,
        salt: &[u8],
        service: &str,
        key: &str,
        sealed: &str,
    ) -> Option<Zeroizing<Vec<u8>>> {
        let raw = STANDARD.decode(sealed).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let record_key = self.record_key(salt, service, key).ok()?;
        let cipher = Aes256Gcm::new_from_slice(&record_key[..]).ok()?;
        let aad = record_info(service, key);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .ok()
            .map(Zeroizing::new)
    }
}

fn record_info(service: &str, key: &str) -> String {
    format!("toolhost:{}/{}", service, key)
}

/// Fresh random salt for a new store file
pub(crate) fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = MasterKey::generate();
        let salt = generate_salt();
        let sealed = key.seal(&salt, "google", "access_token", b"ya29.token").unwrap();
        assert!(!sealed.contains("ya29"));

        let opened = key.open(&salt, "google", "access_token", &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"ya29.token");
    }

    #[test]
    fn test_coordinates_are_bound() {
        let key = MasterKey::generate();
        let salt = generate_salt();
        let sealed = key.seal(&salt, "google", "access_token", b"v").unwrap();
        assert!(key.open(&salt, "google", "refresh_token", &sealed).is_none());
        assert!(key.open(&salt, "github", "access_token", &sealed).is_none());
    }

    #[test]
    fn test_wrong_key_fails() {
        let salt = generate_salt();
        let sealed = MasterKey::generate().seal(&salt, "s", "k", b"v").unwrap();
        assert!(MasterKey::generate().open(&salt, "s", "k", &sealed).is_none());
    }

    #[test]
    fn test_open_garbage() {
        let key = MasterKey::generate();
        let salt = generate_salt();
        assert!(key.open(&salt, "s", "k", "not base64 !!").is_none());
        assert!(key.open(&salt, "s", "k", "AAAA").is_none());
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = MasterKey::generate();
        let parsed = MasterKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed.to_hex().as_str(), key.to_hex().as_str());
        assert!(MasterKey::from_hex("abcd").is_err());
        assert!(MasterKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_key_file_created_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys/master.key");

        let first = MasterKey::from_key_file(&path).unwrap();
        let second = MasterKey::from_key_file(&path).unwrap();
        assert_eq!(first.to_hex().as_str(), second.to_hex().as_str());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_resolve_file_source() {
        let temp_dir = TempDir::new().unwrap();
        let config = SecretsConfig {
            master_key: MasterKeySource::File,
            key_file: temp_dir.path().join("master.key"),
            ..SecretsConfig::default()
        };
        assert!(MasterKey::resolve(&config).is_ok());
        assert!(config.key_file.exists());
    }

    #[test]
    fn test_resolve_env_source_missing() {
        let config = SecretsConfig {
            master_key: MasterKeySource::Env,
            master_key_env: "TOOLHOST_TEST_UNSET_MASTER_KEY".to_string(),
            ..SecretsConfig::default()
        };
        assert!(matches!(
            MasterKey::resolve(&config),
            Err(StorageError::MasterKey(_))
        ));
    }
}
