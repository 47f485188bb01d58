//! Host context handed to plugins
//!
//! Everything a plugin may touch on the host: its keychain, the approval
//! callback, a redacting logger, the shared HTTP client and refresh
//! coordinator, and its own settings table.

use crate::auth::{OAuth2Provider, PkceEngine, RefreshCoordinator};
use crate::config::{HttpConfig, OAuthConfig};
use crate::error::StorageError;
use crate::http::{AuthStrategy, HttpEnvelope, RetryPolicy};
use crate::logging::{PluginLogger, Redactor};
use crate::safety::ApprovalCallback;
use crate::secrets::Keychain;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct HostContext {
    pub plugin_id: String,
    /// Directory the Secret Store is bound to
    pub config_dir: PathBuf,
    pub keychain: Keychain,
    pub approval: Option<Arc<dyn ApprovalCallback>>,
    pub logger: PluginLogger,
    pub refresh: RefreshCoordinator,
    pub http: reqwest::Client,
    pub http_config: HttpConfig,
    pub oauth_config: OAuthConfig,
    /// `[plugins.settings.<id>]` as JSON
    pub settings: Value,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("plugin_id", &self.plugin_id)
            .field("config_dir", &self.config_dir)
            .field("has_approval", &self.approval.is_some())
            .finish()
    }
}

impl HostContext {
    pub fn redactor(&self) -> &Redactor {
        self.keychain.redactor()
    }

    /// String setting from the plugin's settings table
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    /// HTTP envelope with the host's client and retry policy
    pub fn envelope(&self, base_url: &str, auth: AuthStrategy) -> HttpEnvelope {
        HttpEnvelope::new(self.http.clone(), base_url, auth, self.redactor().clone())
            .with_retry_policy(RetryPolicy::from_config(&self.http_config))
    }

    /// PKCE engine over one of the plugin's namespaces
    pub fn pkce_engine(&self, provider: OAuth2Provider) -> Result<PkceEngine, StorageError> {
        let namespace = self.keychain.namespace(&provider.service)?;
        Ok(PkceEngine::new(
            provider,
            namespace,
            self.http.clone(),
            self.oauth_config.clone(),
            self.refresh.clone(),
        ))
    }
}

/// Context over a throwaway store in `dir`, for unit tests
#[cfg(test)]
pub(crate) fn test_context(
    dir: &std::path::Path,
    descriptor: &crate::plugins::PluginDescriptor,
) -> HostContext {
    use crate::secrets::{CredentialBroker, MasterKey, SecretStore};

    let redactor = Redactor::new(false);
    let store = SecretStore::open(dir, MasterKey::from_bytes([7u8; 32])).unwrap();
    let broker = CredentialBroker::new(store, redactor.clone());
    HostContext {
        plugin_id: descriptor.id.clone(),
        config_dir: dir.to_path_buf(),
        keychain: broker.keychain(&descriptor.id, descriptor.declared_services()),
        approval: None,
        logger: PluginLogger::new(&descriptor.id, redactor),
        refresh: RefreshCoordinator::new(),
        http: reqwest::Client::new(),
        http_config: HttpConfig::default(),
        oauth_config: OAuthConfig::default(),
        settings: serde_json::json!({}),
    }
}
