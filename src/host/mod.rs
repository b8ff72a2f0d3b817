//! Node host runtime.
//!
//! Wires the gateway session to the exec pipeline and keeps the connection
//! alive: connect, serve until the session drops, wait, reconnect. Session
//! notifications are drained by a dedicated task so an invoke that runs a
//! long process never stalls frame processing.

pub mod identity;
pub mod invoke;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::NodeHostConfig;
use crate::exec::approval_client::SocketApprovalClient;
use crate::exec::approvals::ApprovalsStore;
use crate::exec::authorize::{ExecAuthorizer, StaticPermissions};
use crate::exec::runner::ProcessRunner;
use crate::protocol::NodeIdentity;
use crate::session::{
    Connector, GatewaySession, SessionError, SessionEvent, SessionOptions, TcpConnector,
};
use crate::skills::SkillBinsCache;

use identity::{GatewayHint, IdentityError, IdentityStore};
use invoke::{InvokeHandler, InvokeLimits, SUPPORTED_COMMANDS};

/// Capability families advertised in `hello`.
pub const NODE_CAPS: &[&str] = &["system"];

#[derive(Error, Debug)]
pub enum HostError {
    #[error("node identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("gateway session: {0}")]
    Session(#[from] SessionError),
}

/// A configured node host, ready to [`run`](NodeHost::run).
pub struct NodeHost {
    config: NodeHostConfig,
    identity: Arc<IdentityStore>,
    session: Arc<GatewaySession>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    connector: Arc<dyn Connector>,
    handler: Arc<InvokeHandler>,
}

impl std::fmt::Debug for NodeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHost")
            .field("endpoint", &self.connector.endpoint())
            .field("identity", &self.identity)
            .field("session", &self.session)
            .finish()
    }
}

impl NodeHost {
    pub fn new(config: NodeHostConfig) -> Result<Self, HostError> {
        let identity = Arc::new(IdentityStore::load_or_create(
            config.node_state_path(),
            config.node.id.as_deref(),
        )?);
        identity.set_display_name(config.node.display_name.clone())?;

        let node = NodeIdentity {
            node_id: identity.node_id(),
            display_name: config.node.display_name.clone(),
            platform: Some(std::env::consts::OS.to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            caps: NODE_CAPS.iter().map(|c| c.to_string()).collect(),
            commands: SUPPORTED_COMMANDS.iter().map(|c| c.to_string()).collect(),
            permissions: (!config.permissions.is_empty()).then(|| config.permissions.clone()),
        };
        let (session, events) = GatewaySession::new(SessionOptions {
            identity: node,
            token: identity.token(),
            handshake_timeout: config.handshake_timeout(),
        });

        let connector: Arc<dyn Connector> = match config.tls_options() {
            Some(tls) => Arc::new(TcpConnector::with_tls(
                config.gateway.host.clone(),
                config.gateway.port,
                &tls,
            )?),
            None => Arc::new(TcpConnector::plain(
                config.gateway.host.clone(),
                config.gateway.port,
            )),
        };

        let approvals = Arc::new(ApprovalsStore::new(config.approvals_path()));
        let skills = Arc::new(SkillBinsCache::new(session.clone(), config.skill_bins_ttl()));
        let authorizer = Arc::new(ExecAuthorizer::new(
            approvals.clone(),
            skills,
            Arc::new(SocketApprovalClient::new(approvals, config.approval_timeout())),
            Arc::new(StaticPermissions::new(config.permissions.clone())),
        ));
        let handler = Arc::new(InvokeHandler::new(
            authorizer,
            Arc::new(ProcessRunner::new()),
            session.clone(),
            InvokeLimits {
                output_cap_chars: config.exec.output_cap_chars,
                event_tail_chars: config.exec.event_tail_chars,
            },
        ));

        Ok(Self {
            config,
            identity,
            session,
            events,
            connector,
            handler,
        })
    }

    /// Replace the transport, e.g. with an in-memory stream.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn session(&self) -> &Arc<GatewaySession> {
        &self.session
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    /// Serve until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), HostError> {
        let Self {
            config,
            identity,
            session,
            events,
            connector,
            handler,
        } = self;

        let hint = GatewayHint {
            host: config.gateway.host.clone(),
            port: config.gateway.port,
            tls: config.tls_options().is_some(),
            fingerprint: config.gateway.tls.fingerprint.clone(),
        };
        let dispatcher = spawn_dispatcher(events, identity, session.clone(), handler, hint);
        let delay = config.reconnect_delay();

        tracing::info!(
            endpoint = %connector.endpoint(),
            node_id = %session.identity().node_id,
            "node host starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                result = session.connect(connector.as_ref()) => match result {
                    Ok(_) => {
                        tokio::select! {
                            _ = session.wait_disconnected() => {}
                            _ = stopped(&mut shutdown) => break,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "gateway connect failed");
                    }
                },
                _ = stopped(&mut shutdown) => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        tracing::info!("node host shutting down");
        session.close().await;
        dispatcher.abort();
        Ok(())
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn spawn_dispatcher(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    identity: Arc<IdentityStore>,
    session: Arc<GatewaySession>,
    handler: Arc<InvokeHandler>,
    hint: GatewayHint,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected(hello) => {
                    tracing::info!(server = ?hello.server_name, "connected to gateway");
                    if let Err(e) = identity.set_gateway(hint.clone()) {
                        tracing::warn!(error = %e, "failed to record gateway");
                    }
                }
                SessionEvent::Disconnected { reason } => {
                    tracing::info!(reason = %reason, "disconnected from gateway");
                }
                SessionEvent::PairToken(token) => {
                    if let Err(e) = identity.set_token(Some(token)) {
                        tracing::error!(error = %e, "failed to persist pairing token");
                    }
                }
                SessionEvent::AuthReset => {
                    if let Err(e) = identity.set_token(None) {
                        tracing::error!(error = %e, "failed to clear pairing token");
                    }
                }
                SessionEvent::Invoke(frame) => {
                    let handler = handler.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        let id = frame.id.clone();
                        let command = frame.command.clone();
                        let res = handler.handle(frame).await;
                        if let Err(e) = session.send_invoke_result(res).await {
                            tracing::warn!(
                                id = %id,
                                command = %command,
                                error = %e,
                                "invoke result dropped"
                            );
                        }
                    });
                }
                SessionEvent::Event(event) => {
                    tracing::debug!(event = %event.event, "gateway event");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> NodeHostConfig {
        NodeHostConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_persists_identity() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.node.id = Some("node-xyz".into());
        config.node.display_name = Some("Build Box".into());
        config.permissions = HashMap::from([("screenRecording".to_string(), false)]);

        let host = NodeHost::new(config).unwrap();
        let node = host.session().identity();
        assert_eq!(node.node_id, "node-xyz");
        assert_eq!(node.caps, vec!["system"]);
        assert!(node.commands.iter().any(|c| c == "system.run"));
        assert_eq!(
            node.permissions.as_ref().and_then(|p| p.get("screenRecording")),
            Some(&false)
        );
        assert!(dir.path().join("node.json").exists());
        assert_eq!(
            host.identity().state().display_name.as_deref(),
            Some("Build Box")
        );
    }

    #[tokio::test]
    async fn test_bad_pin_fails_construction() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.gateway.tls.fingerprint = Some("not-hex".into());
        assert!(matches!(
            NodeHost::new(config),
            Err(HostError::Session(SessionError::Tls(_)))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        // Nothing listens here; the loop keeps retrying until told to stop.
        config.gateway.port = 1;
        config.gateway.reconnect_delay_ms = 10;
        let host = NodeHost::new(config).unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(host.run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
