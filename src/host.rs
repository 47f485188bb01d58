//! The host: owns the Secret Store, broker, registry and dispatcher
//!
//! One `Host` per configuration directory. Plugins see it only through
//! the [`HostContext`] built for them at load time.

use crate::auth::{BrowserLauncher, RefreshCoordinator};
use crate::config::Config;
use crate::context::HostContext;
use crate::error::{HostError, ToolError};
use crate::http::build_client;
use crate::logging::{AuditLogger, PluginLogger, Redactor};
use crate::plugins::{
    builtin_catalog, Dispatcher, InvokeOptions, LoadedPlugin, PluginDescriptor, PluginRegistry,
    PluginStatus,
};
use crate::safety::ApprovalCallback;
use crate::secrets::{CredentialBroker, MasterKey, SecretStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Host {
    config: Config,
    broker: CredentialBroker,
    registry: Arc<PluginRegistry>,
    dispatcher: Dispatcher,
    refresh: RefreshCoordinator,
    http: reqwest::Client,
    approval: Option<Arc<dyn ApprovalCallback>>,
    catalog: Vec<PluginDescriptor>,
}

impl Host {
    /// Open with the master key resolved from configuration
    pub fn open(config: Config) -> Result<Self, HostError> {
        let key = MasterKey::resolve(&config.secrets)?;
        Self::with_master_key(config, key)
    }

    pub fn with_master_key(config: Config, key: MasterKey) -> Result<Self, HostError> {
        let store = SecretStore::open(&config.host.config_dir, key)?;
        let redactor = Redactor::new(config.dispatch.redact_secrets);
        let broker = CredentialBroker::new(store, redactor.clone());
        let http = build_client(&config.http)?;

        let registry = Arc::new(PluginRegistry::new());
        let audit = Arc::new(AuditLogger::new(config.dispatch.clone(), redactor.clone()));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            redactor,
            audit,
            config.dispatch.timeout(),
        );

        info!(
            "Host opened at {:?} (session {})",
            config.host.config_dir,
            AuditLogger::session_id()
        );
        Ok(Self {
            catalog: builtin_catalog(&config.plugins),
            config,
            broker,
            registry,
            dispatcher,
            refresh: RefreshCoordinator::new(),
            http,
            approval: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn redactor(&self) -> &Redactor {
        self.broker.redactor()
    }

    /// Install the approval callback
    ///
    /// Contexts capture the callback when a plugin loads, so install it
    /// before loading.
    pub fn set_approval(&mut self, approval: Option<Arc<dyn ApprovalCallback>>) {
        self.dispatcher.set_approval(approval.clone());
        self.approval = approval;
    }

    /// Add a descriptor to the catalog used by [`Host::load_all`]
    pub fn register(&mut self, descriptor: PluginDescriptor) {
        self.catalog.retain(|d| d.id != descriptor.id);
        self.catalog.push(descriptor);
    }

    /// Built-in plus registered descriptors
    pub fn catalog(&self) -> &[PluginDescriptor] {
        &self.catalog
    }

    /// Catalog descriptor by id
    pub fn descriptor(&self, id: &str) -> Option<&PluginDescriptor> {
        self.catalog.iter().find(|d| d.id == id)
    }

    /// Descriptor of a loaded plugin, else of a catalog entry
    pub async fn find_descriptor(&self, id: &str) -> Option<PluginDescriptor> {
        match self.registry.get(id).await {
            Some(loaded) => Some(loaded.descriptor.clone()),
            None => self.descriptor(id).cloned(),
        }
    }

    /// Context handed to a plugin at initialization
    pub fn context_for(&self, descriptor: &PluginDescriptor) -> HostContext {
        HostContext {
            plugin_id: descriptor.id.clone(),
            config_dir: self.config.host.config_dir.clone(),
            keychain: self
                .broker
                .keychain(&descriptor.id, descriptor.declared_services()),
            approval: self.approval.clone(),
            logger: PluginLogger::new(&descriptor.id, self.redactor().clone()),
            refresh: self.refresh.clone(),
            http: self.http.clone(),
            http_config: self.config.http.clone(),
            oauth_config: self.config.oauth.clone(),
            settings: self.config.plugin_settings(&descriptor.id),
        }
    }

    pub async fn load(
        &self,
        descriptor: PluginDescriptor,
    ) -> Result<Arc<LoadedPlugin>, ToolError> {
        let ctx = self.context_for(&descriptor);
        self.registry.load(descriptor, ctx).await
    }

    /// Load the catalog according to `[plugins]`
    pub async fn load_all(&self) -> usize {
        let loaded = self
            .registry
            .load_catalog(&self.catalog, &self.config.plugins, |d| {
                Ok(self.context_for(d))
            })
            .await;
        debug!("Loaded {} plugins", loaded);
        loaded
    }

    pub async fn unload(&self, id: &str) -> Result<(), ToolError> {
        self.registry.unload(id).await
    }

    pub async fn list(&self) -> Vec<PluginDescriptor> {
        self.registry.list().await
    }

    pub async fn status(&self, id: &str) -> PluginStatus {
        self.registry.status(id).await
    }

    /// Agent-facing manifests of every loaded tool
    pub async fn manifests(&self) -> Vec<Value> {
        self.registry
            .tools()
            .await
            .into_iter()
            .map(|(_, tool)| tool.manifest())
            .collect()
    }

    pub async fn invoke(
        &self,
        plugin_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        self.dispatcher.invoke(plugin_id, tool_name, args).await
    }

    pub async fn invoke_with(
        &self,
        plugin_id: &str,
        tool_name: &str,
        args: Value,
        options: InvokeOptions,
    ) -> Result<Value, ToolError> {
        self.dispatcher
            .invoke_with(plugin_id, tool_name, args, options)
            .await
    }

    /// Run a loaded plugin's interactive authorization
    pub async fn authenticate(
        &self,
        plugin_id: &str,
        browser: &dyn BrowserLauncher,
    ) -> Result<bool, ToolError> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| ToolError::NoSuchPlugin(plugin_id.to_string()))?;
        plugin.instance.authenticate(browser).await
    }

    /// Store config-schema values for a catalog plugin
    ///
    /// Each value lands in its field's service namespace (the plugin's own
    /// by default); one atomic write per namespace.
    pub async fn configure(
        &self,
        plugin_id: &str,
        values: &[(String, String)],
    ) -> Result<(), ToolError> {
        let descriptor = self
            .find_descriptor(plugin_id)
            .await
            .ok_or_else(|| ToolError::NoSuchPlugin(plugin_id.to_string()))?;

        let mut by_service: BTreeMap<String, Vec<(String, String, bool)>> = BTreeMap::new();
        for (key, value) in values {
            let field = descriptor
                .config_schema
                .iter()
                .find(|f| &f.key == key)
                .ok_or_else(|| {
                    ToolError::invalid(key.clone(), format!("not a setting of '{}'", plugin_id))
                })?;
            let service = field
                .service
                .clone()
                .unwrap_or_else(|| plugin_id.to_string());
            by_service
                .entry(service)
                .or_default()
                .push((key.clone(), value.clone(), field.secret));
        }

        for (service, entries) in by_service {
            debug!("Storing {} values under '{}'", entries.len(), service);
            self.broker.set_many(&service, entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{ConfigField, Plugin, ToolDefinition, REST_ID};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct Notes;

    #[async_trait]
    impl Plugin for Notes {
        async fn initialize(&mut self, _ctx: HostContext) -> Result<(), ToolError> {
            Ok(())
        }

        async fn is_configured(&self) -> bool {
            true
        }

        fn tools(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.host.config_dir = dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_open_loads_builtins() {
        let dir = TempDir::new().unwrap();
        let host = Host::with_master_key(config(&dir), MasterKey::generate()).unwrap();
        assert_eq!(host.load_all().await, 1);
        assert_eq!(host.list().await[0].id, REST_ID);

        let names: Vec<String> = host
            .manifests()
            .await
            .iter()
            .map(|m| m["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["rest_get", "rest_send"]);

        // No base_url configured
        assert!(!host.status(REST_ID).await.configured);
        let err = host
            .invoke(REST_ID, "rest_get", json!({"path": "/x"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_configured");
    }

    #[tokio::test]
    async fn test_configure_writes_declared_fields() {
        let dir = TempDir::new().unwrap();
        let host = Host::with_master_key(config(&dir), MasterKey::generate()).unwrap();
        host.configure(REST_ID, &[("token".to_string(), "abc123456".to_string())])
            .await
            .unwrap();
        assert_eq!(
            host.broker().get(REST_ID, "token").await.unwrap().as_deref(),
            Some("abc123456")
        );
        assert!(host.broker().is_secret(REST_ID, "token").await.unwrap());

        let err = host
            .configure(REST_ID, &[("bogus".to_string(), "x".to_string())])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(matches!(
            host.configure("nope", &[]).await,
            Err(ToolError::NoSuchPlugin(_))
        ));
    }

    #[tokio::test]
    async fn test_configure_plugin_loaded_at_runtime() {
        let dir = TempDir::new().unwrap();
        let host = Host::with_master_key(config(&dir), MasterKey::generate()).unwrap();
        let runtime = PluginDescriptor::new("notes", "0.1.0", "Notes", || Box::new(Notes))
            .with_field(ConfigField::password("token", "Notes token"));
        assert!(host.descriptor("notes").is_none());
        host.load(runtime).await.unwrap();

        host.configure("notes", &[("token".to_string(), "n-token-1".to_string())])
            .await
            .unwrap();
        assert_eq!(
            host.broker().get("notes", "token").await.unwrap().as_deref(),
            Some("n-token-1")
        );
    }

    #[tokio::test]
    async fn test_authenticate_requires_loaded_plugin() {
        let dir = TempDir::new().unwrap();
        let host = Host::with_master_key(config(&dir), MasterKey::generate()).unwrap();
        assert!(matches!(
            host.authenticate(REST_ID, &crate::auth::ManualBrowser).await,
            Err(ToolError::NoSuchPlugin(_))
        ));
    }
}
