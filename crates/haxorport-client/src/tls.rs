//! TLS configuration for the control link.
//!
//! Server certificates are verified against the bundled web roots unless
//! `tls_insecure` is set. A configured client certificate and key are loaded
//! for mutual TLS.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::config::ClientConfig;
use crate::error::ClientError;

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// Build the rustls client config for the control connection.
pub(crate) fn build_client_tls(config: &ClientConfig) -> Result<Arc<rustls::ClientConfig>, ClientError> {
    ensure_crypto_provider();

    let builder = if config.tls_insecure {
        warn!("TLS certificate verification disabled (tls_insecure)");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let client_config = if !config.tls_cert.is_empty() && !config.tls_key.is_empty() {
        let certs = load_certs(Path::new(&config.tls_cert))?;
        let key = load_private_key(Path::new(&config.tls_key))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClientError::TransportFailed(format!("invalid client cert/key: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Arc::new(client_config))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ClientError> {
    let file = File::open(path).map_err(|e| {
        ClientError::TransportFailed(format!("failed to open cert file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TransportFailed(format!("failed to parse certs: {e}")))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path).map_err(|e| {
        ClientError::TransportFailed(format!("failed to open key file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::TransportFailed(format!("failed to parse key: {e}")))?
        .ok_or_else(|| ClientError::TransportFailed("no private key found".to_string()))
}

// Certificate verifier that accepts anything (INSECURE).
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
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
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
