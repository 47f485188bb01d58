//! Logging, redaction and the invocation audit trail
//!
//! Secret values written through the credential broker with `secret = true`
//! are registered with a [`Redactor`]; every diagnostic path (plugin loggers,
//! the audit trail, approval prompts, upstream error messages) runs through it.

use crate::config::DispatchConfig;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Session ID for the current host process
static SESSION_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

const REDACTED: &str = "[REDACTED]";

/// Shortest value worth tracking as a secret
const MIN_SECRET_LEN: usize = 4;

/// Secret patterns for free-text redaction
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // API keys and tokens
        Regex::new(
            r#"(?i)(api[_-]?key|token|secret|password|passwd|pwd)\s*[=:]\s*['"]?([^'"\s]+)['"]?"#,
        )
        .unwrap(),
        // Bearer tokens
        Regex::new(r"(?i)bearer\s+[a-zA-Z0-9._~+/=-]+").unwrap(),
        // Private keys
        Regex::new(r"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----").unwrap(),
        // Generic long alphanumeric strings that might be keys
        Regex::new(r"[a-zA-Z0-9_-]{32,}").unwrap(),
    ]
});

/// Authorization header echoes in upstream error bodies
static AUTH_HEADER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)((?:proxy-)?authorization)(["']?\s*[:=]\s*["']?)[^"',\r\n}]+"#).unwrap()
});

/// Argument names whose values are always hidden from displays
static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|secret|token|api[_-]?key|authorization|credential)")
        .unwrap()
});

/// Replaces secret values in diagnostics
#[derive(Debug, Clone)]
pub struct Redactor {
    secrets: Arc<DashSet<String>>,
    patterns: bool,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Redactor {
    /// Create a redactor; `patterns` enables heuristic pattern matching
    pub fn new(patterns: bool) -> Self {
        Self {
            secrets: Arc::new(DashSet::new()),
            patterns,
        }
    }

    /// Track a secret value
    pub fn register(&self, value: &str) {
        if value.len() >= MIN_SECRET_LEN {
            self.secrets.insert(value.to_string());
        }
    }

    /// Stop tracking a secret value
    pub fn forget(&self, value: &str) {
        self.secrets.remove(value);
    }

    /// Whether a value is tracked
    pub fn is_registered(&self, value: &str) -> bool {
        self.secrets.contains(value)
    }

    /// Remove known secrets, then pattern matches when enabled
    pub fn redact(&self, text: &str) -> String {
        let mut result = self.redact_known(text);
        if self.patterns {
            for pattern in SECRET_PATTERNS.iter() {
                result = pattern.replace_all(&result, REDACTED).to_string();
            }
        }
        result
    }

    /// Remove known secrets only
    fn redact_known(&self, text: &str) -> String {
        let mut known: Vec<String> = self.secrets.iter().map(|s| s.key().clone()).collect();
        // Longest first so a secret containing another is replaced whole
        known.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut result = text.to_string();
        for secret in known {
            if result.contains(&secret) {
                result = result.replace(&secret, REDACTED);
            }
        }
        result
    }

    /// Scrub an upstream message of Authorization echoes and secrets
    pub fn scrub_upstream(&self, text: &str) -> String {
        let scrubbed = AUTH_HEADER_PATTERN.replace_all(text, format!("$1$2{}", REDACTED));
        self.redact_known(&scrubbed)
    }

    /// Render tool arguments for display with secrets hidden
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_known(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let shown = if SENSITIVE_KEY.is_match(k) && !v.is_null() {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.redact_value(v)
                        };
                        (k.clone(), shown)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Logger handed to plugins through the host context
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: String,
    redactor: Redactor,
}

impl PluginLogger {
    pub fn new(plugin: &str, redactor: Redactor) -> Self {
        Self {
            plugin: plugin.to_string(),
            redactor,
        }
    }

    pub fn debug(&self, message: &str) {
        debug!(plugin = %self.plugin, "{}", self.redactor.redact(message));
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin, "{}", self.redactor.redact(message));
    }

    pub fn warn(&self, message: &str) {
        warn!(plugin = %self.plugin, "{}", self.redactor.redact(message));
    }

    pub fn error(&self, message: &str) {
        error!(plugin = %self.plugin, "{}", self.redactor.redact(message));
    }
}

/// Audit entry structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Session ID
    pub session_id: String,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event: AuditEvent,
    /// Plugin id
    pub plugin: String,
    /// Tool name
    pub tool: String,
    /// Redacted arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Error code and message for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Types of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Invoked,
    Approved,
    Denied,
    Completed,
    Failed,
    Cancelled,
}

/// JSON-lines audit trail of tool invocations
pub struct AuditLogger {
    config: DispatchConfig,
    redactor: Redactor,
    log_file: Mutex<Option<BufWriter<File>>>,
}

impl AuditLogger {
    /// Create a new audit logger
    pub fn new(config: DispatchConfig, redactor: Redactor) -> Self {
        let log_file = if config.audit_log {
            Self::open_log_file(&config.audit_log_path)
        } else {
            None
        };

        Self {
            config,
            redactor,
            log_file: Mutex::new(log_file),
        }
    }

    /// Open or create the log file
    fn open_log_file(path: &Path) -> Option<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create audit log directory: {}", e);
                return None;
            }
        }

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                error!("Failed to open audit log {:?}: {}", path, e);
                None
            }
        }
    }

    /// Record an event
    pub fn record(
        &self,
        event: AuditEvent,
        plugin: &str,
        tool: &str,
        args: Option<&Value>,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) {
        if !self.config.audit_log {
            return;
        }

        let entry = AuditEntry {
            session_id: SESSION_ID.clone(),
            timestamp: Utc::now(),
            event,
            plugin: plugin.to_string(),
            tool: tool.to_string(),
            args: args.map(|a| self.redact_args(a)),
            error: error.map(|e| self.redact_text(e)),
            duration_ms,
        };

        self.write_entry(&entry);
    }

    fn redact_args(&self, args: &Value) -> Value {
        if self.config.redact_secrets {
            self.redactor.redact_value(args)
        } else {
            args.clone()
        }
    }

    fn redact_text(&self, text: &str) -> String {
        if self.config.redact_secrets {
            self.redactor.redact(text)
        } else {
            text.to_string()
        }
    }

    /// Write an audit entry
    fn write_entry(&self, entry: &AuditEntry) {
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit entry: {}", e);
                return;
            }
        };

        let mut guard = self.log_file.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_rotate(&mut guard);
        if let Some(ref mut file) = *guard {
            if let Err(e) = writeln!(file, "{}", json) {
                error!("Failed to write audit entry: {}", e);
            }
            if let Err(e) = file.flush() {
                warn!("Failed to flush audit log: {}", e);
            }
        }
    }

    /// Rotate log file if needed
    fn maybe_rotate(&self, file: &mut Option<BufWriter<File>>) {
        let path = &self.config.audit_log_path;
        let too_big = fs::metadata(path)
            .map(|m| m.len() > self.config.max_log_size)
            .unwrap_or(false);
        if !too_big {
            return;
        }

        debug!("Rotating audit log files");
        *file = None;

        for i in (1..self.config.log_retention).rev() {
            let old = format!("{}.{}", path.display(), i);
            let new = format!("{}.{}", path.display(), i + 1);
            let _ = fs::rename(&old, &new);
        }

        let rotated = format!("{}.1", path.display());
        let _ = fs::rename(path, &rotated);

        *file = Self::open_log_file(path);
    }

    /// Get session ID
    pub fn session_id() -> &'static str {
        &SESSION_ID
    }
}
