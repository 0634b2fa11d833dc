// TLS configuration from in-memory PEM materials.
//
// Server side builds a `TlsAcceptor` (optionally demanding a client
// certificate validated against the configured CA). Client side builds a
// `TlsConnector`, either verifying against the configured CA or, when
// verification is disabled, accepting any certificate. Passphrase-protected
// private keys must be PKCS#8 encrypted.

use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsOptions;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSetupError {
    MissingCert,
    MissingKey,
    /// `request_cert` demands a CA bundle to validate against.
    MissingCa,
    BadCert(String),
    BadKey(String),
    Verifier(String),
}

impl std::fmt::Display for TlsSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCert => write!(f, "TLS enabled but no certificate provided"),
            Self::MissingKey => write!(f, "TLS enabled but no private key provided"),
            Self::MissingCa => write!(f, "client certificates requested but no CA provided"),
            Self::BadCert(msg) => write!(f, "invalid TLS certificate: {msg}"),
            Self::BadKey(msg) => write!(f, "invalid TLS private key: {msg}"),
            Self::Verifier(msg) => write!(f, "failed to build certificate verifier: {msg}"),
        }
    }
}

impl std::error::Error for TlsSetupError {}

// ---------------------------------------------------------------------------
// Material loading
// ---------------------------------------------------------------------------

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut reader = BufReader::new(pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| TlsSetupError::BadCert(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsSetupError::MissingCert);
    }
    Ok(certs)
}

fn load_key(pem: &[u8], passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    if let Some(pass) = passphrase.filter(|p| !p.is_empty()) {
        if let Ok(key) = decrypt_pkcs8_key(pem, pass) {
            return Ok(key);
        }
        // The material may be unencrypted despite the passphrase; fall
        // through to the plain parse.
    }
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsSetupError::BadKey(e.to_string()))?
        .ok_or(TlsSetupError::MissingKey)
}

fn decrypt_pkcs8_key(pem: &[u8], passphrase: &str) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let text =
        std::str::from_utf8(pem).map_err(|_| TlsSetupError::BadKey("key is not PEM".into()))?;
    let (label, doc) = pkcs8::SecretDocument::from_pem(text)
        .map_err(|e| TlsSetupError::BadKey(e.to_string()))?;
    if label != "ENCRYPTED PRIVATE KEY" {
        return Err(TlsSetupError::BadKey(format!(
            "expected encrypted PKCS#8 key, found '{label}'"
        )));
    }
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(doc.as_bytes())
        .map_err(|e| TlsSetupError::BadKey(e.to_string()))?;
    let decrypted = encrypted
        .decrypt(passphrase.as_bytes())
        .map_err(|e| TlsSetupError::BadKey(e.to_string()))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    )))
}

fn root_store(ca_pem: &[u8]) -> Result<RootCertStore, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| TlsSetupError::BadCert(e.to_string()))?;
    }
    Ok(roots)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub(crate) fn build_acceptor(tls: &TlsOptions) -> Result<TlsAcceptor, TlsSetupError> {
    let certs = load_certs(tls.cert.as_deref().ok_or(TlsSetupError::MissingCert)?)?;
    let key = load_key(
        tls.key.as_deref().ok_or(TlsSetupError::MissingKey)?,
        tls.passphrase.as_deref(),
    )?;

    let builder = ServerConfig::builder();
    let mut config = if tls.request_cert {
        let roots = root_store(tls.ca.as_deref().ok_or(TlsSetupError::MissingCa)?)?;
        let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
        let verifier = if tls.reject_unauthorized {
            verifier_builder.build()
        } else {
            verifier_builder.allow_unauthenticated().build()
        }
        .map_err(|e| TlsSetupError::Verifier(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    }
    .with_single_cert(certs, key)
    .map_err(|e| TlsSetupError::BadKey(e.to_string()))?;

    config.alpn_protocols = tls
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    Ok(TlsAcceptor::from(Arc::new(config)))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub(crate) fn build_connector(tls: &TlsOptions) -> Result<TlsConnector, TlsSetupError> {
    let builder = ClientConfig::builder();

    let builder = if tls.reject_unauthorized {
        // Verification requires a CA bundle; an absent one rejects every
        // peer, which is the conservative default.
        let roots = match &tls.ca {
            Some(ca) => root_store(ca)?,
            None => RootCertStore::empty(),
        };
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
    };

    let mut config = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(
                load_certs(cert)?,
                load_key(key, tls.passphrase.as_deref())?,
            )
            .map_err(|e| TlsSetupError::BadKey(e.to_string()))?,
        _ => builder.with_no_client_auth(),
    };

    config.alpn_protocols = tls
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts any server certificate, used when
/// `reject_unauthorized` is off (self-signed deployments).
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
