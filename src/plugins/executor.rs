//! Tool dispatch
//!
//! Routes `(plugin_id, tool_name, args)` to a handler after the
//! configuration check, schema validation and the approval gate.

use super::loader::{LoadedPlugin, PluginRegistry};
use super::protocol::{ToolArgs, ToolDefinition};
use crate::error::ToolError;
use crate::logging::{AuditEvent, AuditLogger, Redactor};
use crate::safety::{ApprovalCallback, ApprovalDecision, ApprovalRequest};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-invocation overrides
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Replaces the dispatcher's default timeout
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl InvokeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Routes tool invocations to loaded plugins
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    approval: Option<Arc<dyn ApprovalCallback>>,
    redactor: Redactor,
    audit: Arc<AuditLogger>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PluginRegistry>,
        redactor: Redactor,
        audit: Arc<AuditLogger>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            approval: None,
            redactor,
            audit,
            default_timeout,
        }
    }

    /// Install or remove the approval callback
    pub fn set_approval(&mut self, approval: Option<Arc<dyn ApprovalCallback>>) {
        self.approval = approval;
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub async fn invoke(
        &self,
        plugin_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        self.invoke_with(plugin_id, tool_name, args, InvokeOptions::default())
            .await
    }

    /// Invoke with an explicit timeout or cancellation token
    pub async fn invoke_with(
        &self,
        plugin_id: &str,
        tool_name: &str,
        args: Value,
        options: InvokeOptions,
    ) -> Result<Value, ToolError> {
        let started = Instant::now();
        let redacted = self.redactor.redact_value(&args);
        self.audit.record(
            AuditEvent::Invoked,
            plugin_id,
            tool_name,
            Some(&redacted),
            None,
            None,
        );
        debug!("Invoking {}/{}", plugin_id, tool_name);

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let cancel = options.cancel.unwrap_or_default();

        let result = match self.registry.resolve(plugin_id, tool_name).await {
            Err(e) => Err(e),
            Ok((plugin, tool)) => {
                let gated = tool.requires_approval;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ToolError::Cancelled),
                    outcome = tokio::time::timeout(timeout, self.run(plugin_id, tool_name, &plugin, tool, args, &redacted)) => {
                        match outcome {
                            Ok(result) => result,
                            Err(_) => Err(timed_out(tool_name, timeout, gated)),
                        }
                    }
                }
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                info!("{}/{} completed in {}ms", plugin_id, tool_name, elapsed);
                self.audit.record(
                    AuditEvent::Completed,
                    plugin_id,
                    tool_name,
                    None,
                    None,
                    Some(elapsed),
                );
            }
            Err(ToolError::Cancelled) => {
                info!("{}/{} cancelled", plugin_id, tool_name);
                self.audit.record(
                    AuditEvent::Cancelled,
                    plugin_id,
                    tool_name,
                    None,
                    None,
                    Some(elapsed),
                );
            }
            Err(ToolError::Denied { .. }) => {}
            Err(e) => {
                warn!(
                    "{}/{} failed: {}",
                    plugin_id,
                    tool_name,
                    self.redactor.redact(&e.to_string())
                );
                let detail = format!("{}: {}", e.code(), e);
                self.audit.record(
                    AuditEvent::Failed,
                    plugin_id,
                    tool_name,
                    None,
                    Some(&detail),
                    Some(elapsed),
                );
            }
        }
        result
    }

    async fn run(
        &self,
        plugin_id: &str,
        tool_name: &str,
        plugin: &LoadedPlugin,
        tool: ToolDefinition,
        args: Value,
        redacted: &Value,
    ) -> Result<Value, ToolError> {
        if !plugin.instance.is_configured().await {
            return Err(ToolError::NotConfigured {
                plugin: plugin_id.to_string(),
                hint: plugin.descriptor.setup_hint.clone(),
            });
        }

        plugin.validate_args(&tool.name, &args)?;
        let args = ToolArgs::from_value(args)?;

        if tool.requires_approval {
            let decision = match &self.approval {
                Some(approval) => {
                    let request = ApprovalRequest {
                        plugin_id: plugin_id.to_string(),
                        tool: tool_name.to_string(),
                        description: tool.description.clone(),
                        args: redacted.clone(),
                    };
                    approval.request_approval(&request).await
                }
                None => {
                    debug!("No approval callback installed; denying {}", tool_name);
                    ApprovalDecision::Denied
                }
            };

            let event = match decision {
                ApprovalDecision::Approved => AuditEvent::Approved,
                ApprovalDecision::Denied => AuditEvent::Denied,
            };
            self.audit
                .record(event, plugin_id, tool_name, None, None, None);

            if decision == ApprovalDecision::Denied {
                info!("{}/{} denied", plugin_id, tool_name);
                return Err(ToolError::Denied {
                    plugin: plugin_id.to_string(),
                    tool: tool_name.to_string(),
                });
            }
        }

        tool.call(args).await
    }
}

/// A timed-out mutating tool may already have taken effect, so it is not retryable
fn timed_out(tool_name: &str, timeout: Duration, mutating: bool) -> ToolError {
    let message = format!("'{}' timed out after {}s", tool_name, timeout.as_secs());
    if mutating {
        ToolError::Client {
            status: 408,
            message: format!("{}; it may have taken effect", message),
        }
    } else {
        ToolError::Transient(message)
    }
}
