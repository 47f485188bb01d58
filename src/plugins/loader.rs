//! Plugin registry
//!
//! Loads plugins from a compiled catalog of descriptors and keeps the
//! global tool table.

use super::protocol::{is_valid_identifier, Plugin, PluginDescriptor, ToolDefinition};
use super::schema::ArgumentValidator;
use crate::config::PluginConfig;
use crate::context::HostContext;
use crate::error::ToolError;
use crate::safety::looks_mutating;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A plugin that finished initialization
pub struct LoadedPlugin {
    pub descriptor: PluginDescriptor,
    pub instance: Arc<dyn Plugin>,
    tools: BTreeMap<String, ToolDefinition>,
    validators: BTreeMap<String, ArgumentValidator>,
}

impl LoadedPlugin {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    /// Check arguments against the tool's compiled input schema
    pub fn validate_args(&self, tool: &str, args: &Value) -> Result<(), ToolError> {
        match self.validators.get(tool) {
            Some(validator) => validator.validate(args),
            None => Err(ToolError::NoSuchTool(tool.to_string())),
        }
    }
}

/// Result of `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub loaded: bool,
    pub configured: bool,
}

#[derive(Default)]
struct RegistryInner {
    plugins: BTreeMap<String, Arc<LoadedPlugin>>,
    tools: BTreeMap<String, String>, // tool name -> plugin id
}

/// Loaded plugins and the tool-name table
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct, initialize and register one plugin
    ///
    /// Registration is all or nothing: on any error neither the plugin nor
    /// any of its tools become visible.
    pub async fn load(
        &self,
        descriptor: PluginDescriptor,
        ctx: HostContext,
    ) -> Result<Arc<LoadedPlugin>, ToolError> {
        let id = descriptor.id.clone();
        if !is_valid_identifier(&id) {
            return Err(ToolError::invalid(
                "id",
                format!("plugin id '{}' must be snake_case", id),
            ));
        }
        if self.inner.read().await.plugins.contains_key(&id) {
            return Err(ToolError::AlreadyLoaded(id));
        }

        let mut instance = descriptor.create();
        instance.initialize(ctx).await?;
        let (tools, validators) = collect_tools(&id, instance.tools())?;

        let mut inner = self.inner.write().await;
        // Re-check under the write lock; a concurrent load may have won.
        if inner.plugins.contains_key(&id) {
            return Err(ToolError::AlreadyLoaded(id));
        }
        for name in tools.keys() {
            if let Some(existing) = inner.tools.get(name) {
                return Err(ToolError::Collision {
                    tool: name.clone(),
                    existing: existing.clone(),
                    incoming: id,
                });
            }
        }

        for name in tools.keys() {
            inner.tools.insert(name.clone(), id.clone());
        }
        let loaded = Arc::new(LoadedPlugin {
            descriptor,
            instance: Arc::from(instance),
            tools,
            validators,
        });
        inner.plugins.insert(id.clone(), loaded.clone());

        info!("Loaded plugin '{}' with {} tools", id, loaded.tools.len());
        Ok(loaded)
    }

    /// Remove a plugin and its tools
    pub async fn unload(&self, id: &str) -> Result<(), ToolError> {
        let mut inner = self.inner.write().await;
        let plugin = inner
            .plugins
            .remove(id)
            .ok_or_else(|| ToolError::NoSuchPlugin(id.to_string()))?;
        for name in plugin.tools.keys() {
            inner.tools.remove(name);
        }
        info!("Unloaded plugin '{}'", id);
        Ok(())
    }

    /// Descriptors of loaded plugins, ordered by id
    pub async fn list(&self) -> Vec<PluginDescriptor> {
        self.inner
            .read()
            .await
            .plugins
            .values()
            .map(|p| p.descriptor.clone())
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        self.inner.read().await.plugins.get(id).cloned()
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.inner.read().await.plugins.contains_key(id)
    }

    pub async fn status(&self, id: &str) -> PluginStatus {
        let plugin = self.get(id).await;
        let configured = match &plugin {
            Some(p) => p.instance.is_configured().await,
            None => false,
        };
        PluginStatus {
            id: id.to_string(),
            loaded: plugin.is_some(),
            configured,
        }
    }

    /// Manifests of every registered tool, ordered by name
    pub async fn tools(&self) -> Vec<(String, ToolDefinition)> {
        let inner = self.inner.read().await;
        inner
            .tools
            .iter()
            .filter_map(|(name, id)| {
                let tool = inner.plugins.get(id)?.tool(name)?;
                Some((id.clone(), tool.clone()))
            })
            .collect()
    }

    /// Owning plugin of a tool
    pub async fn owner_of(&self, tool: &str) -> Option<String> {
        self.inner.read().await.tools.get(tool).cloned()
    }

    /// Plugin and tool for a dispatch request
    pub async fn resolve(
        &self,
        plugin_id: &str,
        tool_name: &str,
    ) -> Result<(Arc<LoadedPlugin>, ToolDefinition), ToolError> {
        let plugin = self
            .get(plugin_id)
            .await
            .ok_or_else(|| ToolError::NoSuchPlugin(plugin_id.to_string()))?;
        let tool = plugin
            .tool(tool_name)
            .cloned()
            .ok_or_else(|| ToolError::NoSuchTool(tool_name.to_string()))?;
        Ok((plugin, tool))
    }

    /// Load from a catalog according to the `[plugins]` section
    ///
    /// Individual failures are logged and skipped; returns the number of
    /// plugins loaded.
    pub async fn load_catalog<F>(
        &self,
        catalog: &[PluginDescriptor],
        config: &PluginConfig,
        make_ctx: F,
    ) -> usize
    where
        F: Fn(&PluginDescriptor) -> Result<HostContext, ToolError>,
    {
        if !config.enabled {
            debug!("Plugins disabled in configuration");
            return 0;
        }

        let selected: Vec<&PluginDescriptor> = if !config.load.is_empty() {
            // Explicit list wins over auto_load
            config
                .load
                .iter()
                .filter_map(|id| {
                    let found = catalog.iter().find(|d| &d.id == id);
                    if found.is_none() {
                        warn!("Plugin not found in catalog: {}", id);
                    }
                    found
                })
                .collect()
        } else if config.auto_load {
            catalog.iter().collect()
        } else {
            debug!("auto_load disabled and no plugins listed");
            Vec::new()
        };

        let mut loaded = 0;
        for descriptor in selected {
            let result = match make_ctx(descriptor) {
                Ok(ctx) => self.load(descriptor.clone(), ctx).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Failed to load plugin '{}': {}", descriptor.id, e),
            }
        }
        loaded
    }
}

type ToolIndex = (
    BTreeMap<String, ToolDefinition>,
    BTreeMap<String, ArgumentValidator>,
);

/// Validate a plugin's tool list, index it by name and compile its schemas
fn collect_tools(plugin_id: &str, tools: Vec<ToolDefinition>) -> Result<ToolIndex, ToolError> {
    let mut seen = HashSet::new();
    let mut indexed = BTreeMap::new();
    let mut validators = BTreeMap::new();
    let prefix = format!("{}_", plugin_id);

    for tool in tools {
        if !is_valid_identifier(&tool.name) {
            return Err(ToolError::invalid(
                "name",
                format!("tool name '{}' must be snake_case", tool.name),
            ));
        }
        if !seen.insert(tool.name.clone()) {
            return Err(ToolError::invalid(
                "name",
                format!("plugin '{}' declares '{}' twice", plugin_id, tool.name),
            ));
        }
        if !tool.name.starts_with(&prefix) {
            warn!(
                "Tool '{}' of plugin '{}' is not prefixed with the plugin id",
                tool.name, plugin_id
            );
        }
        if looks_mutating(&tool.name) && !tool.requires_approval {
            warn!(
                "Tool '{}' looks destructive but does not require approval",
                tool.name
            );
        }
        validators.insert(tool.name.clone(), ArgumentValidator::compile(&tool.input_schema)?);
        indexed.insert(tool.name.clone(), tool);
    }
    Ok((indexed, validators))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::protocol::InputSchema;
    use crate::context::test_context;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixed {
        names: Vec<&'static str>,
        configured: bool,
    }

    #[async_trait]
    impl Plugin for Fixed {
        async fn initialize(&mut self, _ctx: HostContext) -> Result<(), ToolError> {
            Ok(())
        }

        async fn is_configured(&self) -> bool {
            self.configured
        }

        fn tools(&self) -> Vec<ToolDefinition> {
            self.names
                .iter()
                .map(|name| {
                    ToolDefinition::new(name, "test", InputSchema::object(), |_args| async {
                        Ok::<_, ToolError>(json!({}))
                    })
                })
                .collect()
        }
    }

    fn descriptor(id: &str, names: &[&'static str]) -> PluginDescriptor {
        let names = names.to_vec();
        PluginDescriptor::new(id, "0.1.0", "test plugin", move || {
            Box::new(Fixed {
                names: names.clone(),
                configured: true,
            })
        })
    }

    #[tokio::test]
    async fn test_load_and_resolve() {
        let dir = TempDir::new().unwrap();
        let registry = PluginRegistry::new();
        let d = descriptor("alpha", &["alpha_list", "alpha_get"]);
        registry.load(d.clone(), test_context(dir.path(), &d)).await.unwrap();

        let (plugin, tool) = registry.resolve("alpha", "alpha_get").await.unwrap();
        assert_eq!(plugin.id(), "alpha");
        assert_eq!(tool.name, "alpha_get");
        assert!(plugin.validate_args("alpha_get", &json!({"extra": 1})).is_ok());
        assert!(plugin.validate_args("alpha_get", &json!("text")).is_err());
        assert!(matches!(
            plugin.validate_args("alpha_missing", &json!({})),
            Err(ToolError::NoSuchTool(_))
        ));
        assert_eq!(registry.tools().await.len(), 2);
        assert_eq!(registry.owner_of("alpha_list").await.as_deref(), Some("alpha"));

        assert!(matches!(
            registry.resolve("beta", "alpha_get").await,
            Err(ToolError::NoSuchPlugin(_))
        ));
        assert!(matches!(
            registry.resolve("alpha", "alpha_delete").await,
            Err(ToolError::NoSuchTool(_))
        ));
    }

    #[tokio::test]
    async fn test_collision_keeps_first_plugin() {
        let dir = TempDir::new().unwrap();
        let registry = PluginRegistry::new();
        let first = descriptor("first", &["share_get"]);
        let second = descriptor("second", &["second_list", "share_get"]);
        registry
            .load(first.clone(), test_context(dir.path(), &first))
            .await
            .unwrap();

        let err = registry
            .load(second.clone(), test_context(dir.path(), &second))
            .await
            .err()
            .unwrap();
        match err {
            ToolError::Collision {
                tool,
                existing,
                incoming,
            } => {
                assert_eq!(tool, "share_get");
                assert_eq!(existing, "first");
                assert_eq!(incoming, "second");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(!registry.is_loaded("second").await);
        assert!(registry.owner_of("second_list").await.is_none());
        assert_eq!(registry.owner_of("share_get").await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_duplicate_id_and_duplicate_tool() {
        let dir = TempDir::new().unwrap();
        let registry = PluginRegistry::new();
        let d = descriptor("alpha", &["alpha_list"]);
        registry.load(d.clone(), test_context(dir.path(), &d)).await.unwrap();
        assert!(matches!(
            registry.load(d.clone(), test_context(dir.path(), &d)).await,
            Err(ToolError::AlreadyLoaded(_))
        ));

        let twice = descriptor("twice", &["twice_get", "twice_get"]);
        assert!(matches!(
            registry.load(twice.clone(), test_context(dir.path(), &twice)).await,
            Err(ToolError::InvalidArgument { .. })
        ));
        assert!(!registry.is_loaded("twice").await);
    }

    #[tokio::test]
    async fn test_unload_and_status() {
        let dir = TempDir::new().unwrap();
        let registry = PluginRegistry::new();
        let d = descriptor("alpha", &["alpha_list"]);
        registry.load(d.clone(), test_context(dir.path(), &d)).await.unwrap();

        let status = registry.status("alpha").await;
        assert!(status.loaded && status.configured);

        registry.unload("alpha").await.unwrap();
        assert!(!registry.status("alpha").await.loaded);
        assert!(registry.owner_of("alpha_list").await.is_none());
        assert!(matches!(
            registry.unload("alpha").await,
            Err(ToolError::NoSuchPlugin(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_selection() {
        let dir = TempDir::new().unwrap();
        let catalog = vec![
            descriptor("alpha", &["alpha_list"]),
            descriptor("beta", &["beta_list"]),
        ];
        let ctx = |d: &PluginDescriptor| -> Result<HostContext, ToolError> {
            Ok(test_context(dir.path(), d))
        };

        let registry = PluginRegistry::new();
        let config = PluginConfig {
            load: vec!["beta".into(), "missing".into()],
            ..Default::default()
        };
        assert_eq!(registry.load_catalog(&catalog, &config, ctx).await, 1);
        assert!(registry.is_loaded("beta").await);
        assert!(!registry.is_loaded("alpha").await);

        let registry = PluginRegistry::new();
        assert_eq!(
            registry
                .load_catalog(&catalog, &PluginConfig::default(), ctx)
                .await,
            2
        );

        let registry = PluginRegistry::new();
        let disabled = PluginConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(registry.load_catalog(&catalog, &disabled, ctx).await, 0);
    }
}
