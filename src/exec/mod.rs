//! Remote command execution.
//!
//! An `invoke` of `system.run` arrives as an [`ExecRequest`], passes through
//! the [`authorize::ExecAuthorizer`] pipeline and, if approved, is handed to a
//! [`runner::CommandRunner`] which produces an [`ExecResult`].

pub mod approval_client;
pub mod approvals;
pub mod authorize;
pub mod env;
pub mod output;
pub mod policy;
pub mod runner;
pub mod which;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Host label reported in approval requests and lifecycle events.
pub const EXEC_HOST: &str = "node";

/// Lifecycle event names sent to the gateway.
pub const EVENT_EXEC_STARTED: &str = "exec.started";
pub const EVENT_EXEC_FINISHED: &str = "exec.finished";
pub const EVENT_EXEC_DENIED: &str = "exec.denied";

/// Parameters of a `system.run` invoke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    /// argv tokens; never interpreted by a shell.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default)]
    pub needs_screen_recording: bool,
}

impl ExecRequest {
    /// Text shown to approvers and carried in events.
    pub fn display_command(&self) -> String {
        match self.raw_command.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => raw.to_string(),
            _ => format_argv(&self.command),
        }
    }

    /// Working directory with `~` expanded. Blank means inherit.
    ///
    /// Authorization and the runner both go through this so the allowlist
    /// sees the same binary that gets spawned.
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.cwd
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| PathBuf::from(which::expand_home(c)))
    }

    /// OS permissions this request needs before it may spawn.
    pub fn required_permissions(&self) -> Vec<&'static str> {
        let mut needed = Vec::new();
        if self.needs_screen_recording {
            needed.push("screenRecording");
        }
        needed
    }
}

/// Outcome of running a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub truncated: bool,
}

impl ExecResult {
    /// Result for a process that could not be launched.
    pub fn launch_failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub(crate) fn compute_success(&mut self) {
        self.success = self.exit_code == Some(0) && !self.timed_out && self.error.is_none();
    }
}

/// Represents a decision made on an exec approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecApprovalDecision {
    /// Allow the command to execute this one time.
    AllowOnce,
    /// Allow the command and remember it in the allowlist.
    AllowAlways,
    /// Deny the command execution.
    Deny,
}

impl ExecApprovalDecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "allow-once" => Some(Self::AllowOnce),
            "allow-always" => Some(Self::AllowAlways),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
        }
    }
}

/// What the approver is asked about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecApprovalRequestPayload {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub host: String,
    pub security: String,
    pub ask: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Payload of `exec.started` / `exec.finished` / `exec.denied` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecEventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub run_id: String,
    pub host: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Join argv tokens for display, quoting the ones a shell would split.
pub fn format_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    let needs_quotes = arg
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | '$' | '`'));
    if !needs_quotes {
        return arg.to_string();
    }
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
