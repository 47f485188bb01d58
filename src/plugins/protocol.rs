//! Plugin contract definitions
//!
//! Descriptors, the [`Plugin`] trait, tool definitions with their input
//! schemas, and the typed argument view handed to handlers.

use crate::auth::BrowserLauncher;
use crate::context::HostContext;
use crate::error::ToolError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

/// snake_case identifier used for plugin ids and tool names
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// JSON types understood by the schema validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    #[default]
    Object,
    String,
    Number,
    Integer,
    Boolean,
    Array,
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchemaType::Object => "object",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
        };
        f.write_str(name)
    }
}

/// One property of an input schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl PropertySchema {
    fn of(schema_type: SchemaType, description: &str) -> Self {
        Self {
            schema_type,
            description: description.to_string(),
            ..Self::default()
        }
    }

    pub fn string(description: &str) -> Self {
        Self::of(SchemaType::String, description)
    }

    pub fn number(description: &str) -> Self {
        Self::of(SchemaType::Number, description)
    }

    pub fn integer(description: &str) -> Self {
        Self::of(SchemaType::Integer, description)
    }

    pub fn boolean(description: &str) -> Self {
        Self::of(SchemaType::Boolean, description)
    }

    pub fn object(description: &str) -> Self {
        Self::of(SchemaType::Object, description)
    }

    pub fn array(items: PropertySchema, description: &str) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of(SchemaType::Array, description)
        }
    }

    /// Restrict to a set of string values
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| json!(v)).collect());
        self
    }

    /// Nested property of an object
    pub fn property(mut self, name: &str, schema: PropertySchema, required: bool) -> Self {
        self.properties.insert(name.to_string(), schema);
        if required {
            self.required.push(name.to_string());
        }
        self
    }
}

/// Top-level tool input schema, always of type `object`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl InputSchema {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn optional(mut self, name: &str, schema: PropertySchema) -> Self {
        self.properties.insert(name.to_string(), schema);
        self
    }

    pub fn required(mut self, name: &str, schema: PropertySchema) -> Self {
        self.properties.insert(name.to_string(), schema);
        self.required.push(name.to_string());
        self
    }
}

pub type ToolHandler =
    Arc<dyn Fn(ToolArgs) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// A named operation a plugin exposes
#[derive(Clone)]
pub struct ToolDefinition {
    /// snake_case, prefixed with the plugin id
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    /// Mutates remote state; gated behind user approval
    pub requires_approval: bool,
    handler: ToolHandler,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("requires_approval", &self.requires_approval)
            .finish()
    }
}

impl ToolDefinition {
    pub fn new<F, Fut>(name: &str, description: &str, input_schema: InputSchema, handler: F) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            requires_approval: false,
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }

    pub fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Agent-facing description of the tool
    pub fn manifest(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "requiresApproval": self.requires_approval,
        })
    }

    pub(crate) fn call(&self, args: ToolArgs) -> BoxFuture<'static, Result<Value, ToolError>> {
        (self.handler)(args)
    }
}

/// Validated tool arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    values: Map<String, Value>,
}

impl ToolArgs {
    /// Wrap an argument object; `null` is treated as no arguments
    pub fn from_value(value: Value) -> Result<Self, ToolError> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            Value::Null => Ok(Self::default()),
            other => Err(ToolError::invalid(
                "$",
                format!("arguments must be an object, got {}", json_type(&other)),
            )),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn require_str(&self, name: &str) -> Result<&str, ToolError> {
        self.str(name)
            .ok_or_else(|| ToolError::invalid(name, "is required"))
    }

    pub fn bool(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn array(&self, name: &str) -> Option<&Vec<Value>> {
        self.get(name).and_then(Value::as_array)
    }

    pub fn object(&self, name: &str) -> Option<&Map<String, Value>> {
        self.get(name).and_then(Value::as_object)
    }

    /// Deserialize into a typed argument struct
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(Value::Object(self.values.clone()))
            .map_err(|e| ToolError::invalid("$", e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Kind of a configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Password,
}

/// A value the user supplies when configuring a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    pub key: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    /// Registered with the redactor when stored
    pub secret: bool,
    /// Namespace the value is stored under; the plugin's own when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ConfigField {
    pub fn string(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            kind: FieldKind::String,
            required: false,
            secret: false,
            service: None,
            description: String::new(),
        }
    }

    pub fn password(key: &str, label: &str) -> Self {
        Self {
            kind: FieldKind::Password,
            secret: true,
            ..Self::string(key, label)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// A loaded plugin
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Receive the host context; called once before any other method
    async fn initialize(&mut self, ctx: HostContext) -> Result<(), ToolError>;

    /// Whether the credentials this plugin needs are present
    async fn is_configured(&self) -> bool;

    fn tools(&self) -> Vec<ToolDefinition>;

    /// Interactive authorization; `Ok(false)` when the plugin has none
    async fn authenticate(&self, _browser: &dyn BrowserLauncher) -> Result<bool, ToolError> {
        Ok(false)
    }
}

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Immutable description of a plugin and how to construct it
#[derive(Clone)]
pub struct PluginDescriptor {
    pub id: String,
    pub version: String,
    pub description: String,
    pub config_schema: Vec<ConfigField>,
    /// Shared service namespaces this plugin subscribes to
    pub services: Vec<String>,
    /// Remediation shown when the plugin is not configured
    pub setup_hint: String,
    factory: PluginFactory,
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

impl PluginDescriptor {
    pub fn new<F>(id: &str, version: &str, description: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            version: version.to_string(),
            description: description.to_string(),
            config_schema: Vec::new(),
            services: Vec::new(),
            setup_hint: format!("run `toolhost configure {}`", id),
            factory: Arc::new(factory),
        }
    }

    pub fn with_field(mut self, field: ConfigField) -> Self {
        self.config_schema.push(field);
        self
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.services.push(service.to_string());
        self
    }

    pub fn with_setup_hint(mut self, hint: &str) -> Self {
        self.setup_hint = hint.to_string();
        self
    }

    /// Every namespace the plugin may open besides its own
    pub fn declared_services(&self) -> BTreeSet<String> {
        self.services
            .iter()
            .cloned()
            .chain(self.config_schema.iter().filter_map(|f| f.service.clone()))
            .collect()
    }

    pub fn create(&self) -> Box<dyn Plugin> {
        (self.factory)()
    }

    /// Serializable summary
    pub fn info(&self) -> Value {
        json!({
            "id": self.id,
            "version": self.version,
            "description": self.description,
            "configSchema": self.config_schema,
            "services": self.services,
        })
    }
}
