//! Built-in plugins
//!
//! `rest` is a generic REST adapter driven by `[plugins.settings.rest]`.
//! It reads with `rest_get` and writes with the approval-gated
//! `rest_send`, authenticating through any envelope strategy.

use super::protocol::{
    ConfigField, InputSchema, Plugin, PluginDescriptor, PropertySchema, ToolArgs,
    ToolDefinition,
};
use crate::auth::{
    BrowserLauncher, OAuth1Credentials, OAuth1Signer, OAuth2Provider, PkceEngine, CLIENT_SECRET,
};
use crate::config::PluginConfig;
use crate::context::HostContext;
use crate::error::ToolError;
use crate::http::{AuthStrategy, CallOptions, HttpEnvelope};
use crate::secrets::Namespace;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub const REST_ID: &str = "rest";

const TOKEN_KEY: &str = "token";
const API_KEY: &str = "api_key";

/// Every plugin compiled into the host
pub fn builtin_catalog(config: &PluginConfig) -> Vec<PluginDescriptor> {
    let service = config
        .settings
        .get(REST_ID)
        .and_then(|table| table.get("service"))
        .and_then(|v| v.as_str())
        .unwrap_or(REST_ID);
    vec![rest_descriptor(service)]
}

/// Descriptor of the `rest` plugin storing credentials under `service`
pub fn rest_descriptor(service: &str) -> PluginDescriptor {
    let field = |f: ConfigField| {
        if service == REST_ID {
            f
        } else {
            f.service(service)
        }
    };

    let mut descriptor = PluginDescriptor::new(
        REST_ID,
        env!("CARGO_PKG_VERSION"),
        "Generic REST API access configured from plugins.settings.rest",
        || Box::new(RestPlugin::default()),
    )
    .with_setup_hint(
        "set plugins.settings.rest.base_url, then run `toolhost configure rest` \
         (and `toolhost auth rest` for oauth2)",
    )
    .with_field(field(
        ConfigField::password(TOKEN_KEY, "Bearer token").describe("Used when auth = \"bearer\""),
    ))
    .with_field(field(
        ConfigField::password(API_KEY, "API key").describe("Used when auth = \"api_key\""),
    ))
    .with_field(field(ConfigField::string("client_id", "OAuth2 client ID")))
    .with_field(field(ConfigField::password(CLIENT_SECRET, "OAuth2 client secret")))
    .with_field(field(ConfigField::string("consumer_key", "OAuth1 consumer key")))
    .with_field(field(ConfigField::password(
        "consumer_secret",
        "OAuth1 consumer secret",
    )))
    .with_field(field(ConfigField::password("access_token", "OAuth1 token")))
    .with_field(field(ConfigField::password(
        "access_token_secret",
        "OAuth1 token secret",
    )));

    if service != REST_ID {
        descriptor = descriptor.with_service(service);
    }
    descriptor
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
enum RestAuth {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "bearer")]
    Bearer,
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "oauth1")]
    OAuth1,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RestSettings {
    base_url: Option<String>,
    auth: RestAuth,
    service: Option<String>,
    /// Header for `api_key` auth
    header: Option<String>,
    authorize_url: Option<String>,
    token_url: Option<String>,
    scopes: Vec<String>,
    client_id: Option<String>,
}

struct RestState {
    ctx: HostContext,
    settings: RestSettings,
    namespace: Namespace,
    engine: Option<Arc<PkceEngine>>,
}

impl RestState {
    async fn has_credentials(&self) -> Result<bool, ToolError> {
        Ok(match self.settings.auth {
            RestAuth::None => true,
            RestAuth::Bearer => self.namespace.get(TOKEN_KEY).await?.is_some(),
            RestAuth::ApiKey => self.namespace.get(API_KEY).await?.is_some(),
            RestAuth::OAuth2 => match &self.engine {
                Some(engine) => engine.session().await?.is_some(),
                None => false,
            },
            RestAuth::OAuth1 => OAuth1Credentials::load(&self.namespace).await?.is_some(),
        })
    }

    /// Envelope for the current credentials
    async fn envelope(&self) -> Result<HttpEnvelope, ToolError> {
        let base_url = self.settings.base_url.as_deref().ok_or_else(|| {
            ToolError::NotConfigured {
                plugin: REST_ID.to_string(),
                hint: "plugins.settings.rest.base_url is not set".to_string(),
            }
        })?;

        let namespace = self.namespace.clone();
        let auth = match self.settings.auth {
            RestAuth::None => AuthStrategy::None,
            RestAuth::Bearer => AuthStrategy::Bearer {
                namespace,
                key: TOKEN_KEY.to_string(),
            },
            RestAuth::ApiKey => AuthStrategy::ApiKeyHeader {
                header: self
                    .settings
                    .header
                    .clone()
                    .unwrap_or_else(|| "X-API-Key".to_string()),
                namespace,
                key: API_KEY.to_string(),
            },
            RestAuth::OAuth2 => match &self.engine {
                Some(engine) => AuthStrategy::OAuth2(engine.clone()),
                None => return Err(self.not_configured()),
            },
            RestAuth::OAuth1 => match OAuth1Credentials::load(&namespace).await? {
                Some(credentials) => AuthStrategy::OAuth1 {
                    service: namespace.service().to_string(),
                    signer: Arc::new(OAuth1Signer::new(credentials)),
                },
                None => return Err(self.not_configured()),
            },
        };
        Ok(self.ctx.envelope(base_url, auth))
    }

    fn not_configured(&self) -> ToolError {
        ToolError::NotConfigured {
            plugin: REST_ID.to_string(),
            hint: format!("credentials for '{}' are missing", self.namespace.service()),
        }
    }
}

/// Generic REST plugin
#[derive(Default)]
pub struct RestPlugin {
    state: Option<Arc<RestState>>,
}

#[async_trait]
impl Plugin for RestPlugin {
    async fn initialize(&mut self, ctx: HostContext) -> Result<(), ToolError> {
        let settings: RestSettings = serde_json::from_value(ctx.settings.clone())
            .map_err(|e| ToolError::invalid("plugins.settings.rest", e.to_string()))?;

        let service = settings.service.clone().unwrap_or_else(|| REST_ID.to_string());
        let namespace = ctx.keychain.namespace(&service)?;

        let engine = if settings.auth == RestAuth::OAuth2 {
            let (Some(authorize_url), Some(token_url)) =
                (settings.authorize_url.clone(), settings.token_url.clone())
            else {
                return Err(ToolError::invalid(
                    "plugins.settings.rest",
                    "oauth2 requires authorize_url and token_url",
                ));
            };
            let provider = OAuth2Provider {
                service: service.clone(),
                authorize_url,
                token_url,
                scopes: settings.scopes.clone(),
                client_id: settings.client_id.clone(),
                client_secret: None,
                extra_params: Vec::new(),
            };
            Some(Arc::new(ctx.pkce_engine(provider)?))
        } else {
            None
        };

        debug!("rest plugin using {:?} auth on '{}'", settings.auth, service);
        ctx.logger.debug(&format!(
            "base_url = {}",
            settings.base_url.as_deref().unwrap_or("<unset>")
        ));
        self.state = Some(Arc::new(RestState {
            ctx,
            settings,
            namespace,
            engine,
        }));
        Ok(())
    }

    async fn is_configured(&self) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        if state.settings.base_url.is_none() {
            return false;
        }
        state.has_credentials().await.unwrap_or(false)
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let Some(state) = self.state.clone() else {
            return Vec::new();
        };

        let get_state = state.clone();
        let get = ToolDefinition::new(
            "rest_get",
            "GET a path relative to the configured base URL",
            InputSchema::object()
                .required(
                    "path",
                    PropertySchema::string("Path such as /users/me, or an absolute URL"),
                )
                .optional(
                    "query",
                    PropertySchema::object("Query parameters; values are stringified"),
                ),
            move |args| {
                let state = get_state.clone();
                async move { rest_get(&state, args).await }
            },
        );

        let send = ToolDefinition::new(
            "rest_send",
            "Send a POST, PUT, PATCH or DELETE request with an optional JSON body",
            InputSchema::object()
                .required(
                    "method",
                    PropertySchema::string("HTTP method")
                        .one_of(&["POST", "PUT", "PATCH", "DELETE"]),
                )
                .required("path", PropertySchema::string("Request path"))
                .optional("body", PropertySchema::object("JSON request body"))
                .optional("query", PropertySchema::object("Query parameters")),
            move |args| {
                let state = state.clone();
                async move { rest_send(&state, args).await }
            },
        )
        .requires_approval();

        vec![get, send]
    }

    async fn authenticate(&self, browser: &dyn BrowserLauncher) -> Result<bool, ToolError> {
        let Some(engine) = self.state.as_ref().and_then(|s| s.engine.clone()) else {
            return Ok(false);
        };
        engine
            .authorize(browser)
            .await
            .map_err(|e| e.into_tool_error(engine.service()))?;
        Ok(true)
    }
}

async fn rest_get(state: &RestState, args: ToolArgs) -> Result<Value, ToolError> {
    let path = args.require_str("path")?;
    let options = with_query(CallOptions::get(), &args);
    state.envelope().await?.call_with_retry(path, options).await
}

async fn rest_send(state: &RestState, args: ToolArgs) -> Result<Value, ToolError> {
    let method = args.require_str("method")?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| ToolError::invalid("method", e.to_string()))?;
    let path = args.require_str("path")?;

    let options = match args.get("body") {
        Some(body) => CallOptions::json(method, body.clone()),
        None => CallOptions::method(method),
    };
    let options = with_query(options, &args);
    state.envelope().await?.call(path, options).await
}

fn with_query(mut options: CallOptions, args: &ToolArgs) -> CallOptions {
    if let Some(query) = args.object("query") {
        for (key, value) in query {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            options = options.query(key.clone(), value);
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use serde_json::json;
    use tempfile::TempDir;

    async fn plugin(dir: &TempDir, settings: Value) -> (RestPlugin, HostContext) {
        let descriptor = rest_descriptor(REST_ID);
        let mut ctx = test_context(dir.path(), &descriptor);
        ctx.settings = settings;
        let mut plugin = RestPlugin::default();
        plugin.initialize(ctx.clone()).await.unwrap();
        (plugin, ctx)
    }

    fn tool(plugin: &RestPlugin, name: &str) -> ToolDefinition {
        plugin
            .tools()
            .into_iter()
            .find(|t| t.name == name)
            .unwrap()
    }

    #[test]
    fn test_descriptor_shape() {
        let descriptor = rest_descriptor(REST_ID);
        assert_eq!(descriptor.id, "rest");
        assert!(descriptor.declared_services().is_empty());

        let shared = rest_descriptor("github");
        assert!(shared.declared_services().contains("github"));
        assert!(shared
            .config_schema
            .iter()
            .all(|f| f.service.as_deref() == Some("github")));
    }

    #[test]
    fn test_catalog_reads_service_setting() {
        let mut config = PluginConfig::default();
        let mut table = toml::Table::new();
        table.insert("service".into(), toml::Value::String("acme".into()));
        config.settings.insert("rest".into(), table);
        let catalog = builtin_catalog(&config);
        assert_eq!(catalog.len(), 1);
        assert!(catalog[0].declared_services().contains("acme"));
    }

    #[tokio::test]
    async fn test_unconfigured_without_base_url() {
        let dir = TempDir::new().unwrap();
        let (plugin, _) = plugin(&dir, json!({})).await;
        assert!(!plugin.is_configured().await);
        assert_eq!(plugin.tools().len(), 2);
        assert!(tool(&plugin, "rest_send").requires_approval);
        assert!(!tool(&plugin, "rest_get").requires_approval);
    }

    #[tokio::test]
    async fn test_bearer_get() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/items")
            .match_header("authorization", "Bearer t0k3n")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "2".into()))
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[1,2]}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let (plugin, ctx) = plugin(
            &dir,
            json!({"base_url": server.url(), "auth": "bearer"}),
        )
        .await;
        assert!(!plugin.is_configured().await);
        ctx.keychain.own().set_secret("token", "t0k3n").await.unwrap();
        assert!(plugin.is_configured().await);

        let args = ToolArgs::from_value(json!({"path": "/items", "query": {"page": 2}})).unwrap();
        let result = tool(&plugin, "rest_get").call(args).await.unwrap();
        assert_eq!(result, json!({"items": [1, 2]}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_posts_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_body(mockito::Matcher::Json(json!({"name": "x"})))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":7}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let (plugin, _) = plugin(&dir, json!({"base_url": server.url()})).await;
        assert!(plugin.is_configured().await);

        let args = ToolArgs::from_value(
            json!({"method": "POST", "path": "/items", "body": {"name": "x"}}),
        )
        .unwrap();
        let result = tool(&plugin, "rest_send").call(args).await.unwrap();
        assert_eq!(result["id"], 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_oauth2_requires_endpoints() {
        let dir = TempDir::new().unwrap();
        let descriptor = rest_descriptor(REST_ID);
        let mut ctx = test_context(dir.path(), &descriptor);
        ctx.settings = json!({"base_url": "http://localhost", "auth": "oauth2"});
        let mut plugin = RestPlugin::default();
        assert!(matches!(
            plugin.initialize(ctx).await,
            Err(ToolError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_authenticate_without_oauth2_is_noop() {
        let dir = TempDir::new().unwrap();
        let (plugin, _) = plugin(&dir, json!({"base_url": "http://localhost"})).await;
        let launched = plugin
            .authenticate(&crate::auth::ManualBrowser)
            .await
            .unwrap();
        assert!(!launched);
    }
}
