//! Certificate pinning against a real TLS listener.

use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use carapace_node::session::{Connector, SessionError, TcpConnector};
use carapace_node::tls::{compute_cert_fingerprint, fingerprint_hex, TlsClientOptions};

struct TestServer {
    port: u16,
    cert: CertificateDer<'static>,
}

/// Serve TLS on an ephemeral port; each accepted client gets one greeting line.
async fn spawn_server() -> TestServer {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(tcp).await {
                    let _ = tls.write_all(b"{\"type\":\"ping\",\"id\":\"x\"}\n").await;
                    let _ = tls.flush().await;
                    let mut buf = [0u8; 1];
                    let _ = tls.read(&mut buf).await;
                }
            });
        }
    });

    TestServer { port, cert }
}

fn pinned(port: u16, fingerprint: String) -> TcpConnector {
    TcpConnector::with_tls(
        "127.0.0.1",
        port,
        &TlsClientOptions {
            fingerprint: Some(fingerprint),
            ca_path: None,
            server_name: Some("localhost".to_string()),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_matching_pin_connects() {
    let server = spawn_server().await;
    let connector = pinned(server.port, compute_cert_fingerprint(&server.cert));
    assert_eq!(
        connector.endpoint(),
        format!("tls://127.0.0.1:{}", server.port)
    );

    let mut stream = connector.connect().await.unwrap();
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while stream.read(&mut byte).await.unwrap() == 1 && byte[0] != b'\n' {
        line.push(byte[0]);
    }
    assert_eq!(line, br#"{"type":"ping","id":"x"}"#);
}

#[tokio::test]
async fn test_bare_hex_pin_connects() {
    let server = spawn_server().await;
    let connector = pinned(server.port, fingerprint_hex(&server.cert).to_uppercase());
    assert!(connector.connect().await.is_ok());
}

#[tokio::test]
async fn test_mismatched_pin_is_reported() {
    let server = spawn_server().await;
    let connector = pinned(server.port, "00".repeat(32));

    match connector.connect().await {
        Err(SessionError::FingerprintMismatch { actual }) => {
            assert_eq!(actual, fingerprint_hex(&server.cert));
        }
        Err(other) => panic!("expected fingerprint mismatch, got {other}"),
        Ok(_) => panic!("connection with a wrong pin must fail"),
    }
}

#[tokio::test]
async fn test_self_signed_rejected_without_pin() {
    let server = spawn_server().await;
    let connector = TcpConnector::with_tls(
        "127.0.0.1",
        server.port,
        &TlsClientOptions {
            server_name: Some("localhost".to_string()),
            ..Default::default()
        },
    )
    .unwrap();

    let err = connector.connect().await.err().expect("untrusted cert must fail");
    assert!(matches!(err, SessionError::Io(_)));
}
