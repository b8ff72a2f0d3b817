//! Dispatch of gateway `invoke` frames.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::exec::approvals::ApprovalsError;
use crate::exec::authorize::{Authorization, ExecAuthorizer};
use crate::exec::env::sanitize_env;
use crate::exec::output::{combine_output, tail_excerpt};
use crate::exec::runner::{CommandRunner, RunSpec};
use crate::exec::which::which_bins;
use crate::exec::{
    ExecEventPayload, ExecRequest, EVENT_EXEC_DENIED, EVENT_EXEC_FINISHED, EVENT_EXEC_STARTED,
    EXEC_HOST,
};
use crate::logging::targets;
use crate::protocol::{ErrorShape, InvokeFrame, ResponseFrame};
use crate::session::GatewaySession;

pub const CMD_SYSTEM_RUN: &str = "system.run";
pub const CMD_SYSTEM_WHICH: &str = "system.which";
pub const CMD_EXEC_APPROVALS_GET: &str = "system.execApprovals.get";
pub const CMD_EXEC_APPROVALS_SET: &str = "system.execApprovals.set";

/// Commands advertised in `hello`.
pub const SUPPORTED_COMMANDS: &[&str] = &[
    CMD_SYSTEM_RUN,
    CMD_SYSTEM_WHICH,
    CMD_EXEC_APPROVALS_GET,
    CMD_EXEC_APPROVALS_SET,
];

/// Best-effort lifecycle event delivery.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &str, payload: Value);
}

#[async_trait]
impl EventSink for GatewaySession {
    async fn emit(&self, event: &str, payload: Value) {
        if let Err(e) = self.send_event(event, &payload).await {
            tracing::debug!(target: targets::EXEC, event = %event, error = %e, "event dropped");
        }
    }
}

#[derive(Debug, Deserialize)]
struct WhichParams {
    #[serde(default)]
    bins: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalsSetParams {
    file: Option<Value>,
    base_hash: Option<String>,
}

/// Limits applied to every `system.run`.
#[derive(Debug, Clone, Copy)]
pub struct InvokeLimits {
    pub output_cap_chars: usize,
    pub event_tail_chars: usize,
}

/// Handles one `invoke` at a time; cheap to share across tasks.
pub struct InvokeHandler {
    authorizer: Arc<ExecAuthorizer>,
    runner: Arc<dyn CommandRunner>,
    events: Arc<dyn EventSink>,
    limits: InvokeLimits,
}

impl std::fmt::Debug for InvokeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeHandler")
            .field("authorizer", &self.authorizer)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl InvokeHandler {
    pub fn new(
        authorizer: Arc<ExecAuthorizer>,
        runner: Arc<dyn CommandRunner>,
        events: Arc<dyn EventSink>,
        limits: InvokeLimits,
    ) -> Self {
        Self {
            authorizer,
            runner,
            events,
            limits,
        }
    }

    /// Produce the `invoke-res` for `frame`. Never fails: every problem is
    /// reported as an error response.
    pub async fn handle(&self, frame: InvokeFrame) -> ResponseFrame {
        let params = frame.params();
        let outcome = match frame.command.as_str() {
            CMD_SYSTEM_RUN => self.system_run(params).await,
            CMD_SYSTEM_WHICH => system_which(params),
            CMD_EXEC_APPROVALS_GET => self.approvals_get(),
            CMD_EXEC_APPROVALS_SET => self.approvals_set(params),
            other => Err(ErrorShape::invalid_request(format!(
                "unknown command: {other}"
            ))),
        };
        match outcome {
            Ok(payload) => ResponseFrame::ok(frame.id, &payload),
            Err(error) => ResponseFrame::err(frame.id, error),
        }
    }

    async fn system_run(&self, params: Value) -> Result<Value, ErrorShape> {
        let request: ExecRequest = serde_json::from_value(params)
            .map_err(|e| ErrorShape::invalid_request(format!("invalid system.run params: {e}")))?;
        if request.command.first().map_or(true, |c| c.trim().is_empty()) {
            return Err(ErrorShape::invalid_request("command required"));
        }

        let run_id = Uuid::new_v4().to_string();
        let command = request.display_command();
        let event = |reason: Option<String>| ExecEventPayload {
            session_key: request.session_key.clone(),
            run_id: run_id.clone(),
            host: EXEC_HOST.to_string(),
            command: command.clone(),
            reason,
            ..Default::default()
        };

        let approval = match self.authorizer.authorize(&request).await {
            Authorization::Approved(approval) => approval,
            Authorization::Denied(reason) => {
                tracing::info!(
                    target: targets::EXEC,
                    run_id = %run_id,
                    reason = %reason.as_reason(),
                    "system.run denied"
                );
                self.emit(EVENT_EXEC_DENIED, &event(Some(reason.as_reason())))
                    .await;
                return Err(reason.to_error_shape());
            }
        };

        tracing::info!(
            target: targets::EXEC,
            run_id = %run_id,
            security = approval.policy.security.as_str(),
            "system.run started"
        );
        self.emit(EVENT_EXEC_STARTED, &event(None)).await;

        let spec = RunSpec {
            argv: request.command.clone(),
            cwd: request.working_dir(),
            env: sanitize_env(request.env.as_ref()),
            timeout: request
                .timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            output_cap: self.limits.output_cap_chars,
        };
        let result = self.runner.run(spec).await;

        tracing::info!(
            target: targets::EXEC,
            run_id = %run_id,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            truncated = result.truncated,
            "system.run finished"
        );
        let finished = ExecEventPayload {
            exit_code: result.exit_code,
            timed_out: Some(result.timed_out),
            success: Some(result.success),
            output: Some(tail_excerpt(
                &combine_output(&result.stdout, &result.stderr),
                self.limits.event_tail_chars,
            )),
            ..event(None)
        };
        self.emit(EVENT_EXEC_FINISHED, &finished).await;

        serde_json::to_value(&result).map_err(|e| ErrorShape::unavailable(e.to_string()))
    }

    fn approvals_get(&self) -> Result<Value, ErrorShape> {
        let snapshot = self
            .authorizer
            .approvals()
            .snapshot()
            .map_err(approvals_error_shape)?;
        serde_json::to_value(snapshot).map_err(|e| ErrorShape::unavailable(e.to_string()))
    }

    fn approvals_set(&self, params: Value) -> Result<Value, ErrorShape> {
        let params: ApprovalsSetParams = serde_json::from_value(params).map_err(|e| {
            ErrorShape::invalid_request(format!("invalid execApprovals.set params: {e}"))
        })?;
        let file = params
            .file
            .ok_or_else(|| ErrorShape::invalid_request("file required"))?;
        let snapshot = self
            .authorizer
            .approvals()
            .replace(&file, params.base_hash.as_deref())
            .map_err(approvals_error_shape)?;
        serde_json::to_value(snapshot).map_err(|e| ErrorShape::unavailable(e.to_string()))
    }

    async fn emit(&self, event: &str, payload: &ExecEventPayload) {
        match serde_json::to_value(payload) {
            Ok(value) => self.events.emit(event, value).await,
            Err(e) => {
                tracing::warn!(
                    target: targets::EXEC,
                    error = %e,
                    "failed to encode exec event"
                );
            }
        }
    }
}

fn system_which(params: Value) -> Result<Value, ErrorShape> {
    let params: WhichParams = serde_json::from_value(params)
        .map_err(|e| ErrorShape::invalid_request(format!("invalid system.which params: {e}")))?;
    let path_var = std::env::var_os("PATH");
    let found = which_bins(&params.bins, path_var.as_ref());
    Ok(json!({ "bins": found }))
}

fn approvals_error_shape(err: ApprovalsError) -> ErrorShape {
    match err {
        ApprovalsError::Invalid(_)
        | ApprovalsError::BaseHashRequired
        | ApprovalsError::BaseHashMismatch => ErrorShape::invalid_request(err.to_string()),
        ApprovalsError::Read { .. } | ApprovalsError::Write { .. } => {
            ErrorShape::unavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::approval_client::ApprovalClient;
    use crate::exec::approvals::ApprovalsStore;
    use crate::exec::authorize::StaticPermissions;
    use crate::exec::{ExecApprovalDecision, ExecApprovalRequestPayload, ExecResult};
    use crate::skills::{SkillBinsCache, SkillBinsSource, SkillsError};
    use parking_lot::Mutex;
    use std::ffi::{OsStr, OsString};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NoAnswer;

    #[async_trait]
    impl ApprovalClient for NoAnswer {
        async fn request(&self, _: ExecApprovalRequestPayload) -> Option<ExecApprovalDecision> {
            None
        }
    }

    struct NoBins;

    #[async_trait]
    impl SkillBinsSource for NoBins {
        async fn fetch_bins(&self) -> Result<Vec<String>, SkillsError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(String, Value)>>);

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: &str, payload: Value) {
            self.0.lock().push((event.to_string(), payload));
        }
    }

    /// Returns a canned result and counts spawns.
    struct FakeRunner {
        spawns: AtomicUsize,
        last: Mutex<Option<RunSpec>>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: RunSpec) -> ExecResult {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(spec);
            ExecResult {
                exit_code: Some(0),
                success: true,
                stdout: "hello".into(),
                stderr: "warn".into(),
                ..Default::default()
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        handler: InvokeHandler,
        sink: Arc<RecordingSink>,
        runner: Arc<FakeRunner>,
    }

    fn fixture(approvals: Option<Value>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ApprovalsStore::new(dir.path().join("exec-approvals.json")));
        if let Some(file) = approvals {
            store.replace(&file, None).unwrap();
        }
        let authorizer = Arc::new(ExecAuthorizer::new(
            store,
            Arc::new(SkillBinsCache::new(Arc::new(NoBins), Duration::from_secs(60))),
            Arc::new(NoAnswer),
            Arc::new(StaticPermissions::default()),
        ));
        let sink = Arc::new(RecordingSink::default());
        let runner = Arc::new(FakeRunner {
            spawns: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let handler = InvokeHandler::new(
            authorizer,
            runner.clone(),
            sink.clone(),
            InvokeLimits {
                output_cap_chars: 1000,
                event_tail_chars: 4,
            },
        );
        Fixture {
            _dir: dir,
            handler,
            sink,
            runner,
        }
    }

    fn invoke(command: &str, params: Value) -> InvokeFrame {
        InvokeFrame {
            id: "inv-1".into(),
            command: command.into(),
            params_json: Some(params.to_string()),
        }
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let f = fixture(None);
        let res = f.handler.handle(invoke("system.reboot", json!({}))).await;
        assert!(!res.ok);
        let error = res.error.unwrap();
        assert_eq!(error.code, "INVALID_REQUEST");
        assert_eq!(error.message, "unknown command: system.reboot");
    }

    #[tokio::test]
    async fn test_run_requires_command() {
        let f = fixture(None);
        let res = f.handler.handle(invoke(CMD_SYSTEM_RUN, json!({"command": []}))).await;
        assert_eq!(res.error.unwrap().code, "INVALID_REQUEST");
        let res = f.handler.handle(invoke(CMD_SYSTEM_RUN, json!({"command": "ls"}))).await;
        assert_eq!(res.error.unwrap().code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_denied_run_emits_event_and_never_spawns() {
        let f = fixture(None);
        let res = f
            .handler
            .handle(invoke(
                CMD_SYSTEM_RUN,
                json!({"command": ["echo", "hi"], "sessionKey": "s1"}),
            ))
            .await;
        assert!(!res.ok);
        let error = res.error.unwrap();
        assert_eq!(error.code, "UNAVAILABLE");
        assert!(error.message.starts_with("SYSTEM_RUN_DISABLED"));
        assert_eq!(f.runner.spawns.load(Ordering::SeqCst), 0);

        let events = f.sink.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EVENT_EXEC_DENIED);
        assert_eq!(events[0].1["reason"], "security=deny");
        assert_eq!(events[0].1["sessionKey"], "s1");
        assert_eq!(events[0].1["host"], "node");
        assert_eq!(events[0].1["command"], "echo hi");
    }

    #[tokio::test]
    async fn test_approved_run_events_and_run_spec() {
        let f = fixture(Some(json!({"defaults": {"security": "open", "ask": "never"}})));
        let res = f
            .handler
            .handle(invoke(
                CMD_SYSTEM_RUN,
                json!({
                    "command": ["echo", "hi"],
                    "env": {"FOO": "bar", "LD_PRELOAD": "/evil.so"},
                    "timeoutMs": 0
                }),
            ))
            .await;
        assert!(res.ok);
        let payload = res.payload();
        assert_eq!(payload["stdout"], "hello");
        assert_eq!(payload["success"], true);

        let spec = f.runner.last.lock().clone().unwrap();
        assert_eq!(spec.argv, vec!["echo", "hi"]);
        assert_eq!(spec.output_cap, 1000);
        assert!(spec.timeout.is_none());
        let env = spec.env.unwrap();
        assert_eq!(env.get(OsStr::new("FOO")), Some(&OsString::from("bar")));
        assert!(!env.contains_key(OsStr::new("LD_PRELOAD")));

        let events = f.sink.0.lock();
        let names: Vec<_> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![EVENT_EXEC_STARTED, EVENT_EXEC_FINISHED]);
        let finished = &events[1].1;
        assert_eq!(finished["exitCode"], 0);
        assert_eq!(finished["success"], true);
        // "hello\nwarn" cut to the last 4 characters.
        assert_eq!(finished["output"], "warn");
        assert_eq!(events[0].1["runId"], finished["runId"]);
    }

    #[tokio::test]
    async fn test_which() {
        let f = fixture(None);
        let res = f
            .handler
            .handle(invoke(
                CMD_SYSTEM_WHICH,
                json!({"bins": ["definitely-not-a-real-binary-xyz"]}),
            ))
            .await;
        assert!(res.ok);
        assert_eq!(res.payload(), json!({"bins": {}}));
    }

    #[tokio::test]
    async fn test_approvals_get_and_set() {
        let f = fixture(None);
        let res = f.handler.handle(invoke(CMD_EXEC_APPROVALS_GET, json!({}))).await;
        let snapshot = res.payload();
        assert_eq!(snapshot["exists"], false);

        let res = f
            .handler
            .handle(invoke(
                CMD_EXEC_APPROVALS_SET,
                json!({"file": {"defaults": {"security": "allowlist"}}}),
            ))
            .await;
        assert!(res.ok);
        let hash = res.payload()["hash"].as_str().unwrap().to_string();

        // Stale base hash is rejected.
        let res = f
            .handler
            .handle(invoke(
                CMD_EXEC_APPROVALS_SET,
                json!({"file": {"defaults": {"security": "open"}}, "baseHash": "stale"}),
            ))
            .await;
        assert_eq!(res.error.unwrap().code, "INVALID_REQUEST");

        let res = f
            .handler
            .handle(invoke(
                CMD_EXEC_APPROVALS_SET,
                json!({"file": {"defaults": {"security": "open"}}, "baseHash": hash}),
            ))
            .await;
        assert!(res.ok);
        assert_eq!(res.payload()["file"]["defaults"]["security"], "open");
    }

    #[tokio::test]
    async fn test_approvals_set_requires_file() {
        let f = fixture(None);
        let res = f.handler.handle(invoke(CMD_EXEC_APPROVALS_SET, json!({}))).await;
        let error = res.error.unwrap();
        assert_eq!(error.code, "INVALID_REQUEST");
        assert_eq!(error.message, "file required");
    }
}
