//! Gateway session: connection lifecycle, handshake, pairing, heartbeat.
//!
//! State machine: `Disconnected → Connecting → AwaitingHandshake → Ready`.
//! A reader task owns the inbound half of the stream and handles frames in
//! arrival order. Notifications for the host are pushed on an unbounded
//! channel so nothing the host does can re-enter frame processing.

pub mod rpc;
pub mod transport;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use uuid::Uuid;

use crate::logging::targets;
use crate::protocol::{
    encode_frame, CodecError, ErrorFrame, EventFrame, Frame, FrameDecoder, HelloFrame,
    HelloOkFrame, InvokeFrame, NodeIdentity, PairRequestFrame, RequestFrame, ResponseFrame,
    ERROR_NOT_PAIRED, ERROR_UNAUTHORIZED,
};
use crate::skills::{SkillBinsSource, SkillsError};
use crate::tls::TlsError;

pub use rpc::RpcCorrelator;
pub use transport::{BoxedStream, Connector, TcpConnector};

/// Timeout for the `skills.bins` lookup.
pub const SKILL_BINS_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("gateway certificate fingerprint mismatch (got {actual})")]
    FingerprintMismatch { actual: String },

    #[error("frame encoding failed: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake rejected: {code}: {message}")]
    HandshakeRejected { code: String, message: String },

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("session already connected")]
    AlreadyConnected,

    #[error("session is not connected")]
    NotConnected,

    #[error("session is not ready")]
    NotReady,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("{code}: {message}")]
    Remote { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Ready,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting-handshake",
            Self::Ready => "ready",
        }
    }
}

/// Notifications delivered to the session owner, in frame order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected(HelloOkFrame),
    Disconnected { reason: String },
    /// The stored pairing token was rejected and has been discarded.
    AuthReset,
    /// Pairing issued a token; the owner should persist it.
    PairToken(String),
    Invoke(InvokeFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub identity: NodeIdentity,
    pub token: Option<String>,
    /// `None` waits for the handshake indefinitely (pairing may need a human).
    pub handshake_timeout: Option<Duration>,
}

struct Connection {
    generation: u64,
    writer: WriteHalf<BoxedStream>,
    cancel: Arc<Notify>,
}

type HandshakeResponder = oneshot::Sender<Result<HelloOkFrame, SessionError>>;

/// One logical gateway session, reused across reconnects.
pub struct GatewaySession {
    identity: NodeIdentity,
    token: RwLock<Option<String>>,
    handshake_timeout: Option<Duration>,
    state: watch::Sender<SessionState>,
    conn: Mutex<Option<Connection>>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
    rpc: RpcCorrelator,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("node_id", &self.identity.node_id)
            .field("state", &self.state())
            .field("pending_calls", &self.rpc.len())
            .finish()
    }
}

impl GatewaySession {
    pub fn new(options: SessionOptions) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Disconnected);
        let session = Arc::new(Self {
            identity: options.identity,
            token: RwLock::new(options.token.filter(|t| !t.trim().is_empty())),
            handshake_timeout: options.handshake_timeout,
            state,
            conn: Mutex::new(None),
            connect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            rpc: RpcCorrelator::new(),
            events,
        });
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn pending_calls(&self) -> usize {
        self.rpc.len()
    }

    /// Open a connection and run the handshake.
    ///
    /// Resolves once `hello-ok` arrives. Pairing (`NOT_PAIRED` →
    /// `pair-request` → `pair-ok` → `hello`) happens inside this call.
    pub async fn connect(
        self: &Arc<Self>,
        connector: &dyn Connector,
    ) -> Result<HelloOkFrame, SessionError> {
        let _attempt = self.connect_lock.lock().await;
        if self.state() != SessionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }

        self.set_state(SessionState::Connecting);
        tracing::info!(
            target: targets::SESSION,
            endpoint = %connector.endpoint(),
            "connecting to gateway"
        );
        let stream = match connector.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = Arc::new(Notify::new());
        *self.conn.lock().await = Some(Connection {
            generation,
            writer,
            cancel: cancel.clone(),
        });
        self.set_state(SessionState::AwaitingHandshake);

        let (handshake_tx, handshake_rx) = oneshot::channel();
        tokio::spawn(
            self.clone()
                .read_loop(reader, generation, cancel, handshake_tx),
        );

        if let Err(e) = self.send_hello().await {
            self.close().await;
            return Err(e);
        }

        let outcome = match self.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake_rx).await {
                Ok(result) => result.unwrap_or(Err(SessionError::ConnectionClosed)),
                Err(_) => Err(SessionError::HandshakeTimeout),
            },
            None => handshake_rx
                .await
                .unwrap_or(Err(SessionError::ConnectionClosed)),
        };

        if outcome.is_err() {
            self.close().await;
            self.wait_state(SessionState::Disconnected).await;
        }
        outcome
    }

    /// Drop the current connection, if any. The reader task performs the
    /// disconnect bookkeeping.
    pub async fn close(&self) {
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.cancel.notify_one();
            let _ = conn.writer.shutdown().await;
        }
    }

    /// Wait until the connection is gone. A mid-session re-pair keeps the
    /// socket open and does not count.
    pub async fn wait_disconnected(&self) {
        self.wait_state(SessionState::Disconnected).await;
    }

    async fn wait_state(&self, wanted: SessionState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == wanted).await;
    }

    /// Call a gateway method. Only allowed once the session is `Ready`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        let id = Uuid::new_v4().to_string();
        let rx = self.rpc.register(&id);
        let frame = Frame::Req(RequestFrame {
            id: id.clone(),
            method: method.to_string(),
            params_json: Some(params.to_string()),
        });
        if let Err(e) = self.send_frame(&frame).await {
            self.rpc.remove(&id);
            return Err(e);
        }
        self.rpc.wait(&id, method, rx, timeout).await
    }

    /// Send a one-way `event` frame. Only allowed once `Ready`.
    pub async fn send_event(&self, event: &str, payload: &Value) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        self.send_frame(&Frame::Event(EventFrame {
            event: event.to_string(),
            payload_json: Some(payload.to_string()),
        }))
        .await
    }

    /// Reply to an `invoke`. Only allowed once `Ready`.
    pub async fn send_invoke_result(&self, res: ResponseFrame) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        self.send_frame(&Frame::InvokeRes(res)).await
    }

    async fn send_hello(&self) -> Result<(), SessionError> {
        let token = self.token();
        tracing::debug!(target: targets::SESSION, with_token = token.is_some(), "sending hello");
        self.send_frame(&Frame::Hello(HelloFrame {
            identity: self.identity.clone(),
            token,
        }))
        .await
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = encode_frame(frame)?;
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::NotConnected)?;
        conn.writer.write_all(&bytes).await?;
        conn.writer.flush().await?;
        Ok(())
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(
                target: targets::SESSION,
                from = prev.as_str(),
                to = next.as_str(),
                "state change"
            );
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxedStream>,
        generation: u64,
        cancel: Arc<Notify>,
        handshake: HandshakeResponder,
    ) {
        let mut handshake = Some(handshake);
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_BYTES];

        let reason = 'read: loop {
            tokio::select! {
                _ = cancel.notified() => break 'read "closed locally".to_string(),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break 'read "connection closed by peer".to_string(),
                    Ok(n) => {
                        for frame in decoder.push(&buf[..n]) {
                            if let Err(e) = self.handle_frame(frame, &mut handshake).await {
                                break 'read e.to_string();
                            }
                        }
                    }
                    Err(e) => break 'read format!("read error: {e}"),
                },
            }
        };

        self.teardown(generation, reason, handshake).await;
    }

    /// Process one inbound frame. An error ends the connection.
    async fn handle_frame(
        &self,
        frame: Frame,
        handshake: &mut Option<HandshakeResponder>,
    ) -> Result<(), SessionError> {
        match frame {
            Frame::HelloOk(ok) => {
                self.set_state(SessionState::Ready);
                tracing::info!(
                    target: targets::SESSION,
                    server = ?ok.server_name,
                    "gateway handshake complete"
                );
                self.emit(SessionEvent::Connected(ok.clone()));
                if let Some(tx) = handshake.take() {
                    let _ = tx.send(Ok(ok));
                }
            }
            Frame::Error(ErrorFrame { code, message })
                if code == ERROR_NOT_PAIRED || code == ERROR_UNAUTHORIZED =>
            {
                tracing::info!(
                    target: targets::SESSION,
                    code = %code,
                    message = %message,
                    "gateway requires pairing"
                );
                self.set_state(SessionState::AwaitingHandshake);
                self.set_token(None);
                self.emit(SessionEvent::AuthReset);
                self.send_frame(&Frame::PairRequest(PairRequestFrame {
                    identity: self.identity.clone(),
                }))
                .await?;
            }
            Frame::Error(ErrorFrame { code, message }) => {
                if self.is_ready() {
                    tracing::warn!(
                        target: targets::SESSION,
                        code = %code,
                        message = %message,
                        "gateway error"
                    );
                } else {
                    let err = SessionError::HandshakeRejected {
                        code: code.clone(),
                        message: message.clone(),
                    };
                    if let Some(tx) = handshake.take() {
                        let _ = tx.send(Err(err));
                    }
                    return Err(SessionError::HandshakeRejected { code, message });
                }
            }
            Frame::PairOk(ok) => {
                tracing::info!(target: targets::SESSION, "pairing approved");
                self.set_token(Some(ok.token.clone()));
                self.emit(SessionEvent::PairToken(ok.token));
                self.send_hello().await?;
            }
            Frame::Ping(ping) => {
                self.send_frame(&Frame::Pong(ping)).await?;
            }
            Frame::Res(res) => {
                let id = res.id.clone();
                if !self.rpc.resolve(res) {
                    tracing::debug!(
                        target: targets::SESSION,
                        id = %id,
                        "dropping response for unknown call"
                    );
                }
            }
            Frame::Invoke(invoke) => {
                if self.is_ready() {
                    self.emit(SessionEvent::Invoke(invoke));
                } else {
                    tracing::warn!(
                        target: targets::SESSION,
                        command = %invoke.command,
                        "invoke before handshake, dropped"
                    );
                }
            }
            Frame::Event(event) => self.emit(SessionEvent::Event(event)),
            other => {
                tracing::debug!(target: targets::SESSION, kind = other.kind(), "ignoring frame");
            }
        }
        Ok(())
    }

    async fn teardown(
        &self,
        generation: u64,
        reason: String,
        mut handshake: Option<HandshakeResponder>,
    ) {
        {
            let mut conn = self.conn.lock().await;
            if conn.as_ref().is_some_and(|c| c.generation == generation) {
                if let Some(mut c) = conn.take() {
                    let _ = c.writer.shutdown().await;
                }
            }
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let rejected = self.rpc.reject_all();
        if let Some(tx) = handshake.take() {
            let _ = tx.send(Err(SessionError::ConnectionClosed));
        }
        self.set_state(SessionState::Disconnected);
        tracing::info!(
            target: targets::SESSION,
            reason = %reason,
            rejected_calls = rejected,
            "gateway disconnected"
        );
        self.emit(SessionEvent::Disconnected { reason });
    }
}

#[async_trait]
impl SkillBinsSource for GatewaySession {
    async fn fetch_bins(&self) -> Result<Vec<String>, SkillsError> {
        let payload = self
            .request("skills.bins", json!({}), SKILL_BINS_TIMEOUT)
            .await
            .map_err(|e| SkillsError::Lookup(e.to_string()))?;
        let bins = payload
            .get("bins")
            .and_then(Value::as_array)
            .ok_or_else(|| SkillsError::Lookup("response has no bins array".to_string()))?;
        Ok(bins
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }
}
