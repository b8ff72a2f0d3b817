//! Byte-stream transports for the gateway session.

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

use super::SessionError;
use crate::logging::targets;
use crate::tls::{self, PinMismatch, TlsClientOptions};

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Any duplex byte stream the session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a fresh stream for each connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream, SessionError>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

struct TlsSettings {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    pin: Option<PinMismatch>,
}

/// TCP connector, optionally wrapping the stream in TLS.
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: Option<TlsSettings>,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl TcpConnector {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: None,
        }
    }

    pub fn with_tls(
        host: impl Into<String>,
        port: u16,
        options: &TlsClientOptions,
    ) -> Result<Self, SessionError> {
        let host = host.into();
        let client = tls::build_client_config(options)?;
        let server_name = tls::server_name_for(&host, options)?;
        Ok(Self {
            host,
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: Some(TlsSettings {
                connector: TlsConnector::from(client.config),
                server_name,
                pin: client.pin,
            }),
        })
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    /// `connect_timeout` bounds TCP connect and the TLS handshake together.
    async fn connect(&self) -> Result<BoxedStream, SessionError> {
        let deadline = Instant::now() + self.connect_timeout;
        let addr = (self.host.as_str(), self.port);
        let tcp = tokio::time::timeout_at(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::ConnectTimeout(self.endpoint()))??;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(target: targets::SESSION, error = %e, "set_nodelay failed");
        }

        let Some(tls) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let handshake = tls.connector.connect(tls.server_name.clone(), tcp);
        let result = tokio::time::timeout_at(deadline, handshake)
            .await
            .map_err(|_| SessionError::ConnectTimeout(self.endpoint()))?;
        match result {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => {
                if let Some(actual) = tls.pin.as_ref().and_then(|p| p.take()) {
                    return Err(SessionError::FingerprintMismatch { actual });
                }
                Err(SessionError::Io(e))
            }
        }
    }

    fn endpoint(&self) -> String {
        let scheme = if self.tls.is_some() { "tls" } else { "tcp" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint() {
        assert_eq!(
            TcpConnector::plain("127.0.0.1", 18790).endpoint(),
            "tcp://127.0.0.1:18790"
        );
        let tls = TcpConnector::with_tls(
            "localhost",
            443,
            &TlsClientOptions {
                fingerprint: Some("00".repeat(32)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(tls.endpoint(), "tls://localhost:443");
    }

    #[test]
    fn test_invalid_pin_fails_construction() {
        let result = TcpConnector::with_tls(
            "localhost",
            443,
            &TlsClientOptions {
                fingerprint: Some("xyz".into()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(SessionError::Tls(_))));
    }

    #[tokio::test]
    async fn test_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });
        let mut stream = TcpConnector::plain("127.0.0.1", port)
            .connect()
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_tls_handshake_times_out() {
        // Accepts TCP, never speaks TLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });
        let connector = TcpConnector::with_tls(
            "127.0.0.1",
            port,
            &TlsClientOptions {
                fingerprint: Some("00".repeat(32)),
                server_name: Some("localhost".into()),
                ..Default::default()
            },
        )
        .unwrap()
        .connect_timeout(Duration::from_millis(200));

        let result = tokio::time::timeout(Duration::from_secs(3), connector.connect())
            .await
            .expect("connect must give up on its own");
        assert!(matches!(result, Err(SessionError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn test_refused_connect_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = TcpConnector::plain("127.0.0.1", port).connect().await;
        assert!(result.is_err());
    }
}
