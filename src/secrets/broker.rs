//! Credential Broker
//!
//! Async facade over the Secret Store. Plugins only ever see a [`Keychain`]
//! scoped to their own id and the service namespaces they declared.

use super::store::{SecretStore, SecretValue};
use crate::error::StorageError;
use crate::logging::Redactor;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

type KeyLock = Arc<Mutex<()>>;

/// Serializes writes per `(service, key)` and feeds the redactor
#[derive(Clone)]
pub struct CredentialBroker {
    store: Arc<SecretStore>,
    redactor: Redactor,
    locks: Arc<DashMap<(String, String), KeyLock>>,
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("store", &self.store)
            .finish()
    }
}

impl CredentialBroker {
    pub fn new(store: SecretStore, redactor: Redactor) -> Self {
        Self {
            store: Arc::new(store),
            redactor,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Handle for a plugin over its own namespace plus declared services
    pub fn keychain<I, S>(&self, plugin_id: &str, services: I) -> Keychain
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed: BTreeSet<String> = services.into_iter().map(Into::into).collect();
        allowed.insert(plugin_id.to_string());
        Keychain {
            plugin_id: plugin_id.to_string(),
            allowed: Arc::new(allowed),
            broker: self.clone(),
        }
    }

    fn key_lock(&self, service: &str, key: &str) -> KeyLock {
        self.locks
            .entry((service.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&SecretStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    fn track(&self, record: &SecretValue) {
        if record.secret {
            self.redactor.register(&record.value);
        }
    }

    pub async fn get(&self, service: &str, key: &str) -> Result<Option<String>, StorageError> {
        let (s, k) = (service.to_string(), key.to_string());
        let record = self.blocking(move |store| store.get_record(&s, &k)).await?;
        Ok(record.map(|r| {
            self.track(&r);
            r.value
        }))
    }

    pub async fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        secret: bool,
    ) -> Result<(), StorageError> {
        let lock = self.key_lock(service, key);
        let _guard = lock.lock().await;
        self.write(service, vec![(key.to_string(), value.to_string(), secret)])
            .await
    }

    /// Write several keys of one service in a single store write
    pub async fn set_many(
        &self,
        service: &str,
        entries: Vec<(String, String, bool)>,
    ) -> Result<(), StorageError> {
        let mut locks: Vec<KeyLock> = entries
            .iter()
            .map(|(key, _, _)| self.key_lock(service, key))
            .collect();
        // Fixed acquisition order so overlapping set_many calls cannot deadlock
        locks.sort_by_key(|l| Arc::as_ptr(l) as usize);
        locks.dedup_by_key(|l| Arc::as_ptr(l) as usize);
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }
        self.write(service, entries).await
    }

    async fn write(
        &self,
        service: &str,
        entries: Vec<(String, String, bool)>,
    ) -> Result<(), StorageError> {
        for (_, value, secret) in &entries {
            if *secret {
                self.redactor.register(value);
            }
        }
        let s = service.to_string();
        let count = entries.len();
        self.blocking(move |store| {
            let borrowed: Vec<(&str, &str, bool)> = entries
                .iter()
                .map(|(k, v, secret)| (k.as_str(), v.as_str(), *secret))
                .collect();
            store.set_many(&s, &borrowed)
        })
        .await?;
        debug!("Stored {} record(s) under '{}'", count, service);
        Ok(())
    }

    pub async fn delete(&self, service: &str, key: &str) -> Result<bool, StorageError> {
        let lock = self.key_lock(service, key);
        let _guard = lock.lock().await;
        let (s, k) = (service.to_string(), key.to_string());
        self.blocking(move |store| store.delete(&s, &k)).await
    }

    pub async fn list(&self, service: &str) -> Result<Vec<String>, StorageError> {
        let s = service.to_string();
        self.blocking(move |store| store.list(&s)).await
    }

    pub async fn services(&self) -> Result<Vec<String>, StorageError> {
        self.blocking(|store| store.services()).await
    }

    /// Whether a stored record carries the secret tag
    pub async fn is_secret(&self, service: &str, key: &str) -> Result<bool, StorageError> {
        let (s, k) = (service.to_string(), key.to_string());
        let record = self.blocking(move |store| store.get_record(&s, &k)).await?;
        Ok(record.map(|r| r.secret).unwrap_or(false))
    }

    /// Atomic read-modify-write of one record
    ///
    /// `f` receives the current value and returns the replacement, or `None`
    /// to leave the record untouched.
    pub async fn update<F>(
        &self,
        service: &str,
        key: &str,
        secret: bool,
        f: F,
    ) -> Result<Option<String>, StorageError>
    where
        F: FnOnce(Option<String>) -> Option<String>,
    {
        let lock = self.key_lock(service, key);
        let _guard = lock.lock().await;
        let current = self.get(service, key).await?;
        match f(current) {
            Some(next) => {
                self.write(service, vec![(key.to_string(), next.clone(), secret)])
                    .await?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }
}

/// A plugin's view of the broker
#[derive(Debug, Clone)]
pub struct Keychain {
    plugin_id: String,
    allowed: Arc<BTreeSet<String>>,
    broker: CredentialBroker,
}

impl Keychain {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn redactor(&self) -> &Redactor {
        self.broker.redactor()
    }

    /// Namespaces this handle may open
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// The namespace named after the plugin itself
    pub fn own(&self) -> Namespace {
        Namespace {
            service: self.plugin_id.clone(),
            broker: self.broker.clone(),
        }
    }

    /// Open a declared service namespace
    pub fn namespace(&self, service: &str) -> Result<Namespace, StorageError> {
        if !self.allowed.contains(service) {
            return Err(StorageError::Forbidden {
                plugin: self.plugin_id.clone(),
                service: service.to_string(),
            });
        }
        Ok(Namespace {
            service: service.to_string(),
            broker: self.broker.clone(),
        })
    }
}

/// One `service` coordinate of the Secret Store
#[derive(Debug, Clone)]
pub struct Namespace {
    service: String,
    broker: CredentialBroker,
}

impl Namespace {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.broker.get(&self.service, key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.broker.set(&self.service, key, value, false).await
    }

    /// Store a value and register it for redaction
    pub async fn set_secret(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.broker.set(&self.service, key, value, true).await
    }

    pub async fn set_many(&self, entries: Vec<(String, String, bool)>) -> Result<(), StorageError> {
        self.broker.set_many(&self.service, entries).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.broker.delete(&self.service, key).await
    }

    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.broker.list(&self.service).await
    }

    pub async fn update<F>(
        &self,
        key: &str,
        secret: bool,
        f: F,
    ) -> Result<Option<String>, StorageError>
    where
        F: FnOnce(Option<String>) -> Option<String>,
    {
        self.broker.update(&self.service, key, secret, f).await
    }

    pub fn redactor(&self) -> &Redactor {
        self.broker.redactor()
    }
}
