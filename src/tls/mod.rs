//! TLS for the gateway connection.
//!
//! Provides:
//! - Client configuration with webpki roots plus an optional extra CA file
//! - Certificate pinning: with a pinned fingerprint, chain trust is not
//!   consulted at all and the leaf's SHA-256 must match the pin
//! - SHA-256 fingerprint computation and normalization

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::logging::targets;

/// Errors that can occur during TLS setup
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read certificate file {path}: {message}")]
    CertReadError { path: String, message: String },

    #[error("No certificates found in PEM file: {0}")]
    NoCertsFound(String),

    #[error("Failed to build TLS config: {0}")]
    ConfigBuildError(String),

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("Invalid certificate fingerprint: {0}")]
    InvalidFingerprint(String),
}

/// Client-side TLS settings for the gateway connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsClientOptions {
    /// Pinned SHA-256 leaf fingerprint (any common hex format).
    pub fingerprint: Option<String>,
    /// Extra PEM roots trusted in addition to the webpki set.
    pub ca_path: Option<PathBuf>,
    /// Name to verify/send as SNI instead of the connect host.
    pub server_name: Option<String>,
}

/// Handle for inspecting a pin failure after a handshake error.
#[derive(Debug, Clone, Default)]
pub struct PinMismatch(Arc<Mutex<Option<String>>>);

impl PinMismatch {
    /// Fingerprint of the certificate that failed the pin, if any.
    pub fn take(&self) -> Option<String> {
        self.0.lock().take()
    }

    fn record(&self, actual: String) {
        *self.0.lock() = Some(actual);
    }
}

/// A ready client configuration.
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub config: Arc<rustls::ClientConfig>,
    /// Set when the configuration pins a fingerprint.
    pub pin: Option<PinMismatch>,
}

/// Verifies the server by leaf certificate fingerprint only.
///
/// Handshake signatures are still checked so the peer must hold the key of
/// the pinned certificate.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected: String,
    provider: Arc<CryptoProvider>,
    mismatch: PinMismatch,
}

impl PinnedCertVerifier {
    pub fn new(fingerprint: &str, provider: Arc<CryptoProvider>) -> Result<Self, TlsError> {
        let expected = normalize_fingerprint(fingerprint)
            .ok_or_else(|| TlsError::InvalidFingerprint(fingerprint.to_string()))?;
        Ok(Self {
            expected,
            provider,
            mismatch: PinMismatch::default(),
        })
    }

    pub fn mismatch_handle(&self) -> PinMismatch {
        self.mismatch.clone()
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = fingerprint_hex(end_entity);
        if constant_time_eq(actual.as_bytes(), self.expected.as_bytes()) {
            debug!(target: targets::TLS, "pinned certificate fingerprint matched");
            return Ok(ServerCertVerified::assertion());
        }
        self.mismatch.record(actual);
        Err(rustls::Error::General(
            "certificate fingerprint mismatch".to_string(),
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the rustls client configuration for the gateway connection.
pub fn build_client_config(options: &TlsClientOptions) -> Result<ClientTls, TlsError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::ConfigBuildError(e.to_string()))?;

    let pin = options
        .fingerprint
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty());

    if let Some(pin) = pin {
        let verifier = PinnedCertVerifier::new(pin, provider)?;
        let handle = verifier.mismatch_handle();
        let config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        return Ok(ClientTls {
            config: Arc::new(config),
            pin: Some(handle),
        });
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca_path) = &options.ca_path {
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::ConfigBuildError(e.to_string()))?;
        }
    }
    let config = builder
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(ClientTls {
        config: Arc::new(config),
        pin: None,
    })
}

/// Name presented for SNI and verification.
pub fn server_name_for(
    host: &str,
    options: &TlsClientOptions,
) -> Result<ServerName<'static>, TlsError> {
    let name = options
        .server_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(host)
        .to_string();
    ServerName::try_from(name.clone()).map_err(|_| TlsError::InvalidServerName(name))
}

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(path)
        .map_err(|e| TlsError::CertReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertsFound(path.display().to_string()));
    }

    debug!(
        target: targets::TLS,
        "Loaded {} certificate(s) from {}",
        certs.len(),
        path.display()
    );
    Ok(certs)
}

/// Colon-separated uppercase SHA-256 of a DER certificate, e.g.
/// `AB:CD:EF:01:...`. This is the display form.
pub fn compute_cert_fingerprint(cert_der: &CertificateDer<'_>) -> String {
    Sha256::digest(cert_der.as_ref())
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Lowercase bare-hex SHA-256 of a DER certificate (the comparison form).
pub fn fingerprint_hex(cert_der: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert_der.as_ref()))
}

/// Normalize a user-supplied fingerprint to lowercase bare hex.
///
/// Accepts an optional `sha256:` prefix, colons, dashes and whitespace.
/// Returns `None` unless exactly 32 bytes of hex remain.
pub fn normalize_fingerprint(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let body = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };
    let hex: String = body
        .chars()
        .filter(|c| !matches!(c, ':' | '-') && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
}

/// Constant-time byte comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
