//! Approval gate for destructive tools
//!
//! Tools that mutate remote state are invoked only after an
//! [`ApprovalCallback`] approves the specific invocation. There is no
//! persistent allow-always.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// What the user is asked to approve
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub plugin_id: String,
    pub tool: String,
    pub description: String,
    /// Arguments with secrets redacted
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

/// Asks a human whether one invocation may proceed
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Denies everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalCallback for DenyAll {
    async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Denied
    }
}

/// Approves everything; for unattended runs the operator opted into
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

#[async_trait]
impl ApprovalCallback for ApproveAll {
    async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Adapts a synchronous closure
pub struct ApprovalFn<F>(pub F);

#[async_trait]
impl<F> ApprovalCallback for ApprovalFn<F>
where
    F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync,
{
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        (self.0)(request)
    }
}

/// Prompts on the controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalApprover;

impl TerminalApprover {
    fn prompt(request: &ApprovalRequest) -> ApprovalDecision {
        eprintln!("\n⚠️  {} wants to run '{}'", request.plugin_id, request.tool);
        if !request.description.is_empty() {
            eprintln!("   {}", request.description);
        }
        let args = serde_json::to_string_pretty(&request.args).unwrap_or_default();
        for line in args.lines() {
            eprintln!("   {}", line);
        }

        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                warn!("Cannot prompt for approval: {}", e);
                return ApprovalDecision::Denied;
            }
        };

        loop {
            match editor.readline("Allow this action? [y/N] ") {
                Ok(input) => match input.trim().to_lowercase().as_str() {
                    "y" | "yes" => return ApprovalDecision::Approved,
                    "n" | "no" | "" => return ApprovalDecision::Denied,
                    _ => eprintln!("Please answer y or n."),
                },
                Err(e) => {
                    debug!("Approval prompt closed: {}", e);
                    return ApprovalDecision::Denied;
                }
            }
        }
    }
}

#[async_trait]
impl ApprovalCallback for TerminalApprover {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let request = request.clone();
        tokio::task::spawn_blocking(move || Self::prompt(&request))
            .await
            .unwrap_or(ApprovalDecision::Denied)
    }
}

/// Tool names whose verb suggests a remote mutation
static MUTATING_VERBS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(^|_)(create|delete|remove|send|post|update|write|upload|deploy|trigger|publish|archive|move|rename|share|patch|put|set|add|cancel)(_|$)",
    )
    .unwrap()
});

/// Whether a tool name reads like it mutates remote state
pub fn looks_mutating(tool_name: &str) -> bool {
    MUTATING_VERBS.is_match(tool_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            plugin_id: "github".into(),
            tool: "github_delete_repo".into(),
            description: "Delete a repository".into(),
            args: json!({"repo": "x"}),
        }
    }

    #[tokio::test]
    async fn test_fixed_callbacks() {
        assert_eq!(
            DenyAll.request_approval(&request()).await,
            ApprovalDecision::Denied
        );
        assert_eq!(
            ApproveAll.request_approval(&request()).await,
            ApprovalDecision::Approved
        );
    }

    #[tokio::test]
    async fn test_closure_callback_sees_request() {
        let callback = ApprovalFn(|req: &ApprovalRequest| {
            if req.tool.ends_with("delete_repo") {
                ApprovalDecision::Denied
            } else {
                ApprovalDecision::Approved
            }
        });
        assert_eq!(
            callback.request_approval(&request()).await,
            ApprovalDecision::Denied
        );
    }

    #[test]
    fn test_mutating_names() {
        assert!(looks_mutating("github_delete_repo"));
        assert!(looks_mutating("mail_send"));
        assert!(looks_mutating("drive_upload_file"));
        assert!(!looks_mutating("github_list_repos"));
        assert!(!looks_mutating("mail_search"));
        assert!(!looks_mutating("calendar_get_settings"));
    }
}
