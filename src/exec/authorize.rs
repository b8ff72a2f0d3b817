//! Authorization pipeline for `system.run`.
//!
//! Order of checks:
//! 1. `security=deny` refuses outright.
//! 2. The executable is resolved and checked against the allowlist
//!    (`security=allowlist` only) and the skill bins (`autoAllowSkills` only).
//! 3. A prompt is needed for `ask=always`, or for `ask=on-miss` under
//!    `security=allowlist` when nothing matched.
//! 4. The approver's decision, or `askFallback` when there is none.
//! 5. `security=allowlist` with no match and no grant is an allowlist miss.
//! 6. A matching allowlist entry has its usage recorded.
//! 7. OS permissions the request needs must be granted.

use std::collections::HashMap;
use std::sync::Arc;

use crate::logging::targets;
use crate::protocol::ErrorShape;
use crate::skills::SkillBinsCache;

use super::approval_client::ApprovalClient;
use super::approvals::{AllowlistMatch, ApprovalsStore};
use super::policy::{AskFallback, ExecAsk, ExecPolicy, ExecSecurity};
use super::which::{executable_name, resolve_executable};
use super::{ExecApprovalDecision, ExecApprovalRequestPayload, ExecRequest, EXEC_HOST};

/// Reports whether the host currently holds an OS-level permission.
pub trait PermissionProbe: Send + Sync {
    fn is_granted(&self, permission: &str) -> bool;
}

/// Permissions declared in configuration. Unlisted permissions are not granted.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    granted: HashMap<String, bool>,
}

impl StaticPermissions {
    pub fn new(granted: HashMap<String, bool>) -> Self {
        Self { granted }
    }
}

impl PermissionProbe for StaticPermissions {
    fn is_granted(&self, permission: &str) -> bool {
        self.granted.get(permission).copied().unwrap_or(false)
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    SecurityDeny,
    UserDenied,
    ApprovalRequired,
    AllowlistMiss,
    PermissionMissing(String),
}

impl DenialReason {
    /// Reason string carried in the `exec.denied` event.
    pub fn as_reason(&self) -> String {
        match self {
            Self::SecurityDeny => "security=deny".to_string(),
            Self::UserDenied => "user-denied".to_string(),
            Self::ApprovalRequired => "approval-required".to_string(),
            Self::AllowlistMiss => "allowlist-miss".to_string(),
            Self::PermissionMissing(name) => format!("permission:{name}"),
        }
    }

    /// Error returned in the `invoke-res`.
    pub fn to_error_shape(&self) -> ErrorShape {
        let message = match self {
            Self::SecurityDeny => format!("SYSTEM_RUN_DISABLED: {}", self.as_reason()),
            Self::PermissionMissing(name) => format!("PERMISSION_MISSING: {name}"),
            _ => format!("SYSTEM_RUN_DENIED: {}", self.as_reason()),
        };
        ErrorShape::unavailable(message)
    }
}

/// Details of a granted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub policy: ExecPolicy,
    pub resolved_path: Option<String>,
    pub allowlist_match: Option<AllowlistMatch>,
    pub skill_match: bool,
    pub decision: Option<ExecApprovalDecision>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Approved(Approval),
    Denied(DenialReason),
}

impl Authorization {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }
}

/// Decides whether a `system.run` request may execute.
pub struct ExecAuthorizer {
    approvals: Arc<ApprovalsStore>,
    skills: Arc<SkillBinsCache>,
    approval_client: Arc<dyn ApprovalClient>,
    permissions: Arc<dyn PermissionProbe>,
}

impl std::fmt::Debug for ExecAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecAuthorizer")
            .field("approvals", &self.approvals.path())
            .finish_non_exhaustive()
    }
}

impl ExecAuthorizer {
    pub fn new(
        approvals: Arc<ApprovalsStore>,
        skills: Arc<SkillBinsCache>,
        approval_client: Arc<dyn ApprovalClient>,
        permissions: Arc<dyn PermissionProbe>,
    ) -> Self {
        Self {
            approvals,
            skills,
            approval_client,
            permissions,
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalsStore> {
        &self.approvals
    }

    pub async fn authorize(&self, request: &ExecRequest) -> Authorization {
        let file = self.approvals.load_or_default();
        let agent_id = request.agent_id.as_deref();
        let policy = file.resolve_policy(agent_id);

        if policy.security == ExecSecurity::Deny {
            return Authorization::Denied(DenialReason::SecurityDeny);
        }

        let raw_executable = request
            .command
            .first()
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let cwd = request.working_dir();
        let resolved_path = resolve_executable(&raw_executable, None, cwd.as_deref())
            .map(|p| p.to_string_lossy().into_owned());

        let allowlist_match = if policy.security == ExecSecurity::Allowlist {
            file.find_allowlist_match(agent_id, resolved_path.as_deref(), &raw_executable)
        } else {
            None
        };
        let skill_match = policy.auto_allow_skills
            && self
                .skills
                .contains(resolved_path.as_deref().unwrap_or(&raw_executable))
                .await;
        let matched = allowlist_match.is_some() || skill_match;

        let needs_prompt = match policy.ask {
            ExecAsk::Always => true,
            ExecAsk::OnMiss => policy.security == ExecSecurity::Allowlist && !matched,
            ExecAsk::Never => false,
        };

        let mut granted = false;
        let mut decision = None;
        if needs_prompt {
            let payload = ExecApprovalRequestPayload {
                command: request.display_command(),
                cwd: request.cwd.clone(),
                host: EXEC_HOST.to_string(),
                security: policy.security.as_str().to_string(),
                ask: policy.ask.as_str().to_string(),
                agent_id: request.agent_id.clone(),
                resolved_path: resolved_path.clone(),
                session_key: request.session_key.clone(),
            };
            decision = self.approval_client.request(payload).await;
            match decision {
                Some(ExecApprovalDecision::Deny) => {
                    return Authorization::Denied(DenialReason::UserDenied);
                }
                Some(ExecApprovalDecision::AllowOnce) => granted = true,
                Some(ExecApprovalDecision::AllowAlways) => {
                    granted = true;
                    let pattern = resolved_path.as_deref().unwrap_or(&raw_executable);
                    if let Err(e) = self.approvals.add_allowlist_entry(agent_id, pattern) {
                        tracing::warn!(
                            target: targets::APPROVALS,
                            error = %e,
                            "failed to persist allowlist entry"
                        );
                    }
                }
                None => match policy.ask_fallback {
                    AskFallback::Full => granted = true,
                    AskFallback::Allowlist if matched => {}
                    AskFallback::Allowlist | AskFallback::Deny => {
                        return Authorization::Denied(DenialReason::ApprovalRequired);
                    }
                },
            }
        }

        if policy.security == ExecSecurity::Allowlist && !matched && !granted {
            return Authorization::Denied(DenialReason::AllowlistMiss);
        }

        if let Some(hit) = &allowlist_match {
            if let Err(e) = self.approvals.record_use(
                hit,
                &request.display_command(),
                resolved_path.as_deref(),
            ) {
                tracing::warn!(
                    target: targets::APPROVALS,
                    error = %e,
                    "failed to record allowlist use"
                );
            }
        }

        for permission in request.required_permissions() {
            if !self.permissions.is_granted(permission) {
                return Authorization::Denied(DenialReason::PermissionMissing(
                    permission.to_string(),
                ));
            }
        }

        tracing::debug!(
            target: targets::EXEC,
            executable = %executable_name(&raw_executable),
            security = policy.security.as_str(),
            allowlisted = allowlist_match.is_some(),
            skill = skill_match,
            "command authorized"
        );
        Authorization::Approved(Approval {
            policy,
            resolved_path,
            allowlist_match,
            skill_match,
            decision,
        })
    }
}
