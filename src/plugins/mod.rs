//! Plugin system for toolhost
//!
//! Plugins are compiled in and described by a [`PluginDescriptor`]. The
//! registry loads them, the dispatcher routes tool invocations to them.

mod builtin;
mod executor;
mod loader;
mod protocol;
mod schema;

pub use builtin::{builtin_catalog, rest_descriptor, RestPlugin, REST_ID};
pub use executor::{Dispatcher, InvokeOptions};
pub use loader::{LoadedPlugin, PluginRegistry, PluginStatus};
pub use protocol::{
    is_valid_identifier, ConfigField, FieldKind, InputSchema, Plugin, PluginDescriptor,
    PluginFactory, PropertySchema, SchemaType, ToolArgs, ToolDefinition, ToolHandler,
};
pub use schema::ArgumentValidator;
