//! Error types for toolhost

use thiserror::Error;

/// Top-level error for the host binary
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to the host agent by tool dispatch and plugin handlers
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Plugin '{plugin}' is not configured: {hint}")]
    NotConfigured { plugin: String, hint: String },

    #[error("Authorization for '{service}' expired: {reason}")]
    AuthExpired { service: String, reason: String },

    #[error("Invalid argument '{path}': {reason}")]
    InvalidArgument { path: String, reason: String },

    #[error("Invocation of '{tool}' was denied by the user")]
    Denied { plugin: String, tool: String },

    #[error("No such tool: {0}")]
    NoSuchTool(String),

    #[error("No such plugin: {0}")]
    NoSuchPlugin(String),

    #[error("Upstream error: {status} - {message}")]
    Client { status: u16, message: String },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tool '{tool}' from plugin '{incoming}' collides with plugin '{existing}'")]
    Collision {
        tool: String,
        existing: String,
        incoming: String,
    },

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Invocation cancelled")]
    Cancelled,
}

impl ToolError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotConfigured { .. } => "not_configured",
            ToolError::AuthExpired { .. } => "auth_expired",
            ToolError::InvalidArgument { .. } => "invalid_argument",
            ToolError::Denied { .. } => "denied",
            ToolError::NoSuchTool(_) => "no_such_tool",
            ToolError::NoSuchPlugin(_) => "no_such_plugin",
            ToolError::Client { .. } => "client_error",
            ToolError::Transient(_) => "transient_error",
            ToolError::Storage(_) => "storage_error",
            ToolError::Collision { .. } => "collision",
            ToolError::AlreadyLoaded(_) => "already_loaded",
            ToolError::Cancelled => "cancelled",
        }
    }

    /// Whether an idempotent call failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }

    /// Shorthand for argument errors raised by handlers
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidArgument {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// JSON form for machine consumers
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

/// Secret Store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Secret store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record {service}/{key} is corrupt")]
    Corrupt { service: String, key: String },

    #[error("Secret store file is corrupt: {0}")]
    CorruptFile(String),

    #[error("Master key does not match this secret store")]
    WrongKey,

    #[error("Encryption failure: {0}")]
    Crypto(String),

    #[error("Master key unavailable: {0}")]
    MasterKey(String),

    #[error("Plugin '{plugin}' may not access service namespace '{service}'")]
    Forbidden { plugin: String, service: String },

    #[error("Failed to serialize secret store: {0}")]
    Serialize(String),

    #[error("Invalid record name: {0}")]
    InvalidName(String),
}

impl Clone for StorageError {
    fn clone(&self) -> Self {
        match self {
            StorageError::Io(e) => StorageError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StorageError::Corrupt { service, key } => StorageError::Corrupt {
                service: service.clone(),
                key: key.clone(),
            },
            StorageError::CorruptFile(m) => StorageError::CorruptFile(m.clone()),
            StorageError::WrongKey => StorageError::WrongKey,
            StorageError::Crypto(m) => StorageError::Crypto(m.clone()),
            StorageError::MasterKey(m) => StorageError::MasterKey(m.clone()),
            StorageError::Forbidden { plugin, service } => StorageError::Forbidden {
                plugin: plugin.clone(),
                service: service.clone(),
            },
            StorageError::Serialize(m) => StorageError::Serialize(m.clone()),
            StorageError::InvalidName(m) => StorageError::InvalidName(m.clone()),
        }
    }
}

/// Interactive authorization errors
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Failed to start redirect listener: {0}")]
    Listener(String),

    #[error("Failed to open browser: {0}")]
    Browser(String),

    #[error("OAuth state mismatch")]
    StateMismatch,

    #[error("Provider returned an error: {0}")]
    Provider(String),

    #[error("Timed out waiting for the authorization redirect")]
    Timeout,

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("No client_id configured for '{0}'")]
    MissingClientId(String),

    #[error("Failed to sign request: {0}")]
    Signing(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AuthError {
    /// Convert into the dispatch taxonomy for a given service
    pub fn into_tool_error(self, service: &str) -> ToolError {
        match self {
            AuthError::Storage(e) => ToolError::Storage(e),
            AuthError::Signing(reason) => ToolError::invalid("url", reason),
            other => ToolError::AuthExpired {
                service: service.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Result type alias using HostError
pub type Result<T> = std::result::Result<T, HostError>;
