//! TLS trust for the tunnel connection.
//!
//! Builds the rustls client configuration for the selected
//! [`TrustPolicy`](crate::config::TrustPolicy):
//!
//! - `Default` — the bundled webpki root set. Hosts in the field routinely
//!   have stale OS stores missing ISRG Root X1; bundling sidesteps that.
//! - `SystemStore` — the operating system's certificate store.
//! - `CaFile` — a custom PEM bundle, trusted exclusively.
//! - `NoVerify` — certificate verification disabled entirely.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

use crate::config::TrustPolicy;

/// Build a rustls client config for the given trust policy.
pub fn client_config(policy: &TrustPolicy) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Rustls(e.to_string()))?;

    let config = match policy {
        TrustPolicy::Default => builder
            .with_root_certificates(webpki_root_store())
            .with_no_client_auth(),
        TrustPolicy::SystemStore => builder
            .with_root_certificates(native_root_store()?)
            .with_no_client_auth(),
        TrustPolicy::CaFile(path) => builder
            .with_root_certificates(pem_root_store(path)?)
            .with_no_client_auth(),
        TrustPolicy::NoVerify => {
            warn!("TLS certificate verification is DISABLED");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
                .with_no_client_auth()
        }
    };
    Ok(config)
}

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn native_root_store() -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        warn!("system trust store: {error}");
    }
    for cert in loaded.certs {
        if let Err(e) = roots.add(cert) {
            warn!("skipping unparseable system root: {e}");
        }
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyStore("system trust store yielded no roots".into()));
    }
    Ok(roots)
}

fn pem_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Io(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TlsError::Io(path.to_path_buf(), e))?;
        roots
            .add(cert)
            .map_err(|e| TlsError::Rustls(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyStore(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(roots)
}

/// Accepts any server certificate. Signatures are still checked so the
/// connection at least talks TLS to something holding the presented key.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
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

/// TLS setup failures, fatal at startup.
#[derive(Debug)]
pub enum TlsError {
    Io(PathBuf, std::io::Error),
    EmptyStore(String),
    Rustls(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "{}: {e}", path.display()),
            Self::EmptyStore(msg) | Self::Rustls(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for TlsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_builds() {
        assert!(client_config(&TrustPolicy::Default).is_ok());
    }

    #[test]
    fn no_verify_policy_builds() {
        assert!(client_config(&TrustPolicy::NoVerify).is_ok());
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let err = client_config(&TrustPolicy::CaFile(PathBuf::from(
            "/nonexistent/ca-bundle.pem",
        )))
        .unwrap_err();
        assert!(matches!(err, TlsError::Io(..)));
    }

    #[test]
    fn certless_ca_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "not a certificate\n").unwrap();
        let err = client_config(&TrustPolicy::CaFile(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, TlsError::EmptyStore(_)));
    }
}
