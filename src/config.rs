//! Configuration management for toolhost
//!
//! Handles loading and merging configuration from multiple sources:
//! 1. Compiled defaults
//! 2. User config (<config_dir>/config.toml)
//! 3. CLI-specified config file
//! 4. Environment variables

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "TOOLHOST_CONFIG_DIR";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub secrets: SecretsConfig,
    pub oauth: OAuthConfig,
    pub http: HttpConfig,
    pub dispatch: DispatchConfig,
    pub plugins: PluginConfig,
}

/// Host-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory the Secret Store is bound to
    pub config_dir: PathBuf,
}

/// Where the master key for the Secret Store comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterKeySource {
    /// Environment, then OS keyring, then key file
    Auto,
    /// Environment variable only
    Env,
    /// OS keyring only
    Keyring,
    /// Key file only
    File,
}

/// Secret Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Master key source
    pub master_key: MasterKeySource,
    /// Environment variable holding a hex-encoded master key
    pub master_key_env: String,
    /// Key file used when the OS keyring is unavailable
    pub key_file: PathBuf,
    /// Service name used for the OS keyring entry
    pub keyring_service: String,
}

/// OAuth redirect listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Loopback host for redirect URIs
    pub redirect_host: String,
    /// Fixed loopback port
    pub redirect_port: u16,
    /// Seconds to wait for the browser redirect
    pub callback_timeout: u64,
    /// Open the system browser automatically
    pub open_browser: bool,
}

/// Upstream HTTP configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout: u64,
    /// User agent sent upstream
    pub user_agent: String,
    /// Maximum attempts for retryable calls
    pub retry_attempts: u32,
    /// Initial backoff delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub retry_max_delay_ms: u64,
}

/// Tool dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-invocation timeout in seconds
    pub timeout: u64,
    /// Write an audit line per invocation
    pub audit_log: bool,
    /// Audit log path
    pub audit_log_path: PathBuf,
    /// Maximum audit log size before rotation
    pub max_log_size: u64,
    /// Number of rotated logs to keep
    pub log_retention: u32,
    /// Redact secrets from logs and approval prompts
    pub redact_secrets: bool,
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Enable plugins
    pub enabled: bool,
    /// Auto-load every plugin in the catalog
    pub auto_load: bool,
    /// Specific plugins to load
    pub load: Vec<String>,
    /// Per-plugin settings tables
    pub settings: BTreeMap<String, toml::Table>,
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolhost")
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        let data = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            master_key: MasterKeySource::Auto,
            master_key_env: "TOOLHOST_MASTER_KEY".to_string(),
            key_file: data.join("toolhost/master.key"),
            keyring_service: "toolhost".to_string(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_host: "127.0.0.1".to_string(),
            redirect_port: 4839,
            callback_timeout: 300,
            open_browser: true,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            user_agent: format!("toolhost/{}", env!("CARGO_PKG_VERSION")),
            retry_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: 60,
            audit_log: false,
            audit_log_path: default_config_dir().join("logs/invocations.log"),
            max_log_size: 10 * 1024 * 1024, // 10MB
            log_retention: 5,
            redact_secrets: true,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_load: true,
            load: vec![],
            settings: BTreeMap::new(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl OAuthConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout)
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(cli_config: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(cli_config, None)
    }

    /// Like [`Config::load`], with an explicit configuration directory
    /// taking precedence over every other source
    pub fn load_with(
        cli_config: Option<&Path>,
        config_dir: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            config.host.config_dir = PathBuf::from(dir);
        }
        if let Some(dir) = config_dir {
            config.host.config_dir = dir.to_path_buf();
        }

        // Load user config from the config directory
        let user_config = config.host.config_dir.join("config.toml");
        if user_config.exists() {
            debug!("Loading user config from {:?}", user_config);
            config.merge_from_file(&user_config)?;
        }

        // Load CLI-specified config
        if let Some(path) = cli_config {
            debug!("Loading CLI config from {:?}", path);
            config.merge_from_file(path)?;
        }

        config.apply_env_overrides();
        if let Some(dir) = config_dir {
            config.host.config_dir = dir.to_path_buf();
        }
        config.validate()?;

        Ok(config)
    }

    /// Merge configuration from a file
    fn merge_from_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let file_config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

        self.merge(file_config);
        Ok(())
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config) {
        if other.host.config_dir != HostConfig::default().config_dir {
            self.host.config_dir = other.host.config_dir;
        }

        // Secrets
        let secrets_default = SecretsConfig::default();
        if other.secrets.master_key != secrets_default.master_key {
            self.secrets.master_key = other.secrets.master_key;
        }
        if other.secrets.master_key_env != secrets_default.master_key_env {
            self.secrets.master_key_env = other.secrets.master_key_env;
        }
        if other.secrets.key_file != secrets_default.key_file {
            self.secrets.key_file = other.secrets.key_file;
        }
        if other.secrets.keyring_service != secrets_default.keyring_service {
            self.secrets.keyring_service = other.secrets.keyring_service;
        }

        // OAuth and HTTP sections are taken whole when present
        if other.oauth != OAuthConfig::default() {
            self.oauth = other.oauth;
        }
        if other.http != HttpConfig::default() {
            self.http = other.http;
        }

        // Dispatch
        let dispatch_default = DispatchConfig::default();
        self.dispatch.timeout = other.dispatch.timeout;
        self.dispatch.audit_log = other.dispatch.audit_log;
        self.dispatch.redact_secrets = other.dispatch.redact_secrets;
        if other.dispatch.audit_log_path != dispatch_default.audit_log_path {
            self.dispatch.audit_log_path = other.dispatch.audit_log_path;
        }

        // Plugins
        self.plugins.enabled = other.plugins.enabled;
        self.plugins.auto_load = other.plugins.auto_load;
        if !other.plugins.load.is_empty() {
            self.plugins.load = other.plugins.load;
        }
        for (id, table) in other.plugins.settings {
            self.plugins.settings.entry(id).or_default().extend(table);
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            self.host.config_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("TOOLHOST_REDIRECT_PORT") {
            match port.parse() {
                Ok(port) => self.oauth.redirect_port = port,
                Err(_) => debug!("Ignoring invalid TOOLHOST_REDIRECT_PORT: {}", port),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.config_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("host.config_dir".to_string()));
        }
        if self.secrets.master_key_env.is_empty() {
            return Err(ConfigError::MissingField("secrets.master_key_env".to_string()));
        }
        if self.http.timeout == 0 {
            return Err(ConfigError::Invalid("http.timeout must be > 0".to_string()));
        }
        if self.dispatch.timeout == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.timeout must be > 0".to_string(),
            ));
        }
        if self.http.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "http.retry_attempts must be at least 1".to_string(),
            ));
        }
        for id in self.plugins.load.iter().chain(self.plugins.settings.keys()) {
            if !crate::plugins::is_valid_identifier(id) {
                return Err(ConfigError::Invalid(format!(
                    "plugin id '{}' must be snake_case",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Settings table for one plugin, as JSON
    pub fn plugin_settings(&self, plugin_id: &str) -> serde_json::Value {
        self.plugins
            .settings
            .get(plugin_id)
            .and_then(|table| serde_json::to_value(table).ok())
            .unwrap_or_else(|| serde_json::json!({}))
    }

    /// Path of the Secret Store file
    pub fn secrets_path(&self) -> PathBuf {
        crate::secrets::store_path(&self.host.config_dir)
    }
}
