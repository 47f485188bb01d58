//! toolhost - plugin host and credential substrate for agent tools
//!
//! A registry of integration plugins that expose named tools over remote
//! APIs, backed by an encrypted secret store, OAuth engines and an
//! approval gate for destructive tools.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod http;
pub mod logging;
pub mod plugins;
pub mod safety;
pub mod secrets;

pub use config::Config;
pub use context::HostContext;
pub use error::{AuthError, ConfigError, HostError, StorageError, ToolError};
pub use host::Host;
pub use plugins::{
    InputSchema, InvokeOptions, Plugin, PluginDescriptor, PropertySchema, ToolArgs,
    ToolDefinition,
};
pub use safety::{ApprovalCallback, ApprovalDecision, ApprovalRequest};
