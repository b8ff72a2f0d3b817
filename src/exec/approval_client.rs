//! Client side of the local approval channel.
//!
//! The approval service listens on a Unix socket named in the approvals
//! file. One request per connection; the service answers with a single
//! `decision` line or not at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::logging::targets;

use super::approvals::ApprovalsStore;
use super::{ExecApprovalDecision, ExecApprovalRequestPayload};

/// Default wait for a human decision (2 minutes).
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;

/// Longest reply line accepted from the approval service, newline included.
const MAX_REPLY_LINE_BYTES: u64 = 64 * 1024;

/// Asks a human approver about a command.
///
/// `None` means no answer: timeout, unreachable service, or garbage reply.
#[async_trait]
pub trait ApprovalClient: Send + Sync {
    async fn request(&self, payload: ExecApprovalRequestPayload) -> Option<ExecApprovalDecision>;
}

#[derive(Debug, Serialize)]
struct SocketRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    token: &'a str,
    id: &'a str,
    request: &'a ExecApprovalRequestPayload,
}

#[derive(Debug, Deserialize)]
struct SocketReply {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    decision: Option<String>,
}

/// [`ApprovalClient`] talking to the approvals socket.
#[derive(Debug, Clone)]
pub struct SocketApprovalClient {
    store: Arc<ApprovalsStore>,
    timeout: Duration,
}

impl SocketApprovalClient {
    pub fn new(store: Arc<ApprovalsStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl ApprovalClient for SocketApprovalClient {
    async fn request(&self, payload: ExecApprovalRequestPayload) -> Option<ExecApprovalDecision> {
        let file = self.store.load_or_default();
        let socket_path = self.store.socket_path(&file);
        let token = file
            .socket
            .as_ref()
            .and_then(|s| s.token.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or_default()
            .to_string();

        let id = Uuid::new_v4().to_string();
        let line = match serde_json::to_string(&SocketRequest {
            kind: "request",
            token: &token,
            id: &id,
            request: &payload,
        }) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(
                    target: targets::APPROVALS,
                    error = %e,
                    "failed to encode approval request"
                );
                return None;
            }
        };

        tracing::info!(
            target: targets::APPROVALS,
            id = %id,
            command = %payload.command,
            socket = %socket_path.display(),
            "requesting approval"
        );
        match tokio::time::timeout(self.timeout, exchange(&socket_path, line, &id)).await {
            Ok(Some(decision)) => {
                tracing::info!(
                    target: targets::APPROVALS,
                    id = %id,
                    decision = decision.as_str(),
                    "approval decided"
                );
                Some(decision)
            }
            Ok(None) => {
                tracing::info!(
                    target: targets::APPROVALS,
                    id = %id,
                    "approval channel gave no decision"
                );
                None
            }
            Err(_) => {
                tracing::info!(target: targets::APPROVALS, id = %id, "approval timed out");
                None
            }
        }
    }
}

#[cfg(unix)]
async fn exchange(
    socket_path: &std::path::Path,
    line: String,
    id: &str,
) -> Option<ExecApprovalDecision> {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let stream = match UnixStream::connect(socket_path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(target: targets::APPROVALS, error = %e, "approval socket unreachable");
            return None;
        }
    };
    let (reader, mut writer) = stream.into_split();
    if let Err(e) = writer.write_all(format!("{line}\n").as_bytes()).await {
        tracing::debug!(target: targets::APPROVALS, error = %e, "approval request write failed");
        return None;
    }
    let _ = writer.flush().await;

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_REPLY_LINE_BYTES)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => return None,
            Ok(n) if n as u64 == MAX_REPLY_LINE_BYTES && buf.last() != Some(&b'\n') => {
                tracing::debug!(
                    target: targets::APPROVALS,
                    limit = MAX_REPLY_LINE_BYTES,
                    "approval reply line too long"
                );
                return None;
            }
            Ok(_) => {
                let decision = std::str::from_utf8(&buf)
                    .ok()
                    .and_then(|reply| parse_reply(reply, id));
                if decision.is_some() {
                    return decision;
                }
            }
            Err(e) => {
                tracing::debug!(
                    target: targets::APPROVALS,
                    error = %e,
                    "approval socket read failed"
                );
                return None;
            }
        }
    }
}

#[cfg(not(unix))]
async fn exchange(
    _socket_path: &std::path::Path,
    _line: String,
    _id: &str,
) -> Option<ExecApprovalDecision> {
    None
}

/// A decision line for request `id`, if `line` is one.
fn parse_reply(line: &str, id: &str) -> Option<ExecApprovalDecision> {
    let reply: SocketReply = serde_json::from_str(line.trim()).ok()?;
    if reply.kind != "decision" || reply.id.as_deref() != Some(id) {
        return None;
    }
    reply.decision.as_deref().and_then(ExecApprovalDecision::parse)
}
