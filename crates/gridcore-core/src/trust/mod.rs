//! TLS trust for the worker's outbound sessions.
//!
//! The worker ships with its own root CA bundle compiled into the binary
//! (the webpki root store) and never consults the host OS trust store.
//! Two verification modes exist and no others are selectable:
//!
//! - [`VerifyMode::Relaxed`] for DNS-named hosts: the peer certificate
//!   chain and hostname are verified against the bundled roots on every
//!   handshake; a verification failure is logged and the handshake is
//!   allowed to continue.
//! - [`VerifyMode::None`] for literal-IP hosts (local development): no
//!   verification at all.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tracing::warn;

/// Connect timeout applied to every session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Overall request timeout applied to every session.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors raised while building the trust context.
#[derive(Debug, Error)]
pub enum TrustError {
    /// An embedded PEM block could not be parsed. Fatal.
    #[error("invalid PEM certificate block: {0}")]
    InvalidPem(String),

    /// The certificate verifier could not be assembled.
    #[error("could not build certificate verifier: {0}")]
    VerifierBuild(String),
}

/// Peer verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify against the bundled roots; continue on failure.
    Relaxed,
    /// Skip verification entirely (literal-IP development hosts).
    None,
}

impl VerifyMode {
    /// Selects the mode for a target host: literal IP addresses get
    /// [`VerifyMode::None`], DNS names get [`VerifyMode::Relaxed`].
    #[must_use]
    pub fn for_host(host: &str) -> Self {
        if host.parse::<IpAddr>().is_ok() {
            Self::None
        } else {
            Self::Relaxed
        }
    }
}

/// The worker's trust store: bundled roots plus any extra PEM blocks.
#[derive(Debug, Default)]
pub struct TrustStore {
    extra_roots: Vec<CertificateDer<'static>>,
}

impl TrustStore {
    /// Creates the trust store backed by the compiled-in root bundle.
    #[must_use]
    pub fn bundled() -> Self {
        Self::default()
    }

    /// Appends every certificate in a PEM bundle to the store.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::InvalidPem`] if any block fails to parse;
    /// a partially-loaded bundle is never used.
    pub fn with_pem_bundle(mut self, pem: &str) -> Result<Self, TrustError> {
        let mut reader = std::io::Cursor::new(pem.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| TrustError::InvalidPem(e.to_string()))?;
            self.extra_roots.push(cert);
        }
        Ok(self)
    }

    /// Produces a client builder configured for `mode`.
    ///
    /// Both modes use the rustls backend and never load the host OS
    /// store. [`VerifyMode::Relaxed`] verifies against the compiled-in
    /// roots through [`RelaxedVerifier`]; [`VerifyMode::None`] performs
    /// no verification and loads no roots.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] if the bundled or extra roots cannot be
    /// assembled into a verifier.
    pub fn client_builder(
        &self,
        mode: VerifyMode,
    ) -> Result<reqwest::blocking::ClientBuilder, TrustError> {
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        match mode {
            VerifyMode::Relaxed => {
                builder = builder.use_preconfigured_tls(self.relaxed_tls_config()?);
            },
            VerifyMode::None => {
                builder = builder
                    .use_rustls_tls()
                    .tls_built_in_root_certs(false)
                    .danger_accept_invalid_certs(true);
            },
        }
        Ok(builder)
    }

    /// Builds the relaxed-verification TLS configuration.
    fn relaxed_tls_config(&self) -> Result<ClientConfig, TrustError> {
        let verifier = self.relaxed_verifier()?;
        Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth())
    }

    fn relaxed_verifier(&self) -> Result<Arc<RelaxedVerifier>, TrustError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in &self.extra_roots {
            roots
                .add(cert.clone())
                .map_err(|e| TrustError::InvalidPem(e.to_string()))?;
        }
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TrustError::VerifierBuild(e.to_string()))?;
        Ok(Arc::new(RelaxedVerifier { inner }))
    }
}

/// Verifies the peer against the bundled roots but lets the handshake
/// continue when verification fails.
///
/// Certificate chain and hostname failures are demoted to a warning;
/// handshake signature checks stay strict, they are delegated to the
/// webpki verifier unchanged.
#[derive(Debug)]
struct RelaxedVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for RelaxedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(err) => {
                warn!(
                    server = %format_args!("{server_name:?}"),
                    error = %err,
                    "peer verification failed, continuing handshake"
                );
                Ok(ServerCertVerified::assertion())
            },
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_mode_for_host() {
        assert_eq!(VerifyMode::for_host("127.0.0.1"), VerifyMode::None);
        assert_eq!(VerifyMode::for_host("::1"), VerifyMode::None);
        assert_eq!(VerifyMode::for_host("cc.example.org"), VerifyMode::Relaxed);
        assert_eq!(VerifyMode::for_host("localhost"), VerifyMode::Relaxed);
    }

    #[test]
    fn test_invalid_pem_block_is_fatal() {
        let bundle = "-----BEGIN CERTIFICATE-----\nnot a certificate\n-----END CERTIFICATE-----\n";
        let result = TrustStore::bundled().with_pem_bundle(bundle);
        assert!(matches!(result, Err(TrustError::InvalidPem(_))));
    }

    #[test]
    fn test_empty_bundle_adds_nothing() {
        let store = TrustStore::bundled().with_pem_bundle("").unwrap();
        assert!(store.extra_roots.is_empty());
    }

    #[test]
    fn test_relaxed_verifier_verifies_but_continues_on_failure() {
        let verifier = TrustStore::bundled().relaxed_verifier().unwrap();
        // A certificate no verifier could accept: the chain check fails,
        // and relaxed mode waves the handshake through anyway.
        let bogus = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x01]);
        let name = ServerName::try_from("cc.example.org").unwrap();
        let result = verifier.verify_server_cert(&bogus, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn test_relaxed_verifier_delegates_signature_schemes() {
        let verifier = TrustStore::bundled().relaxed_verifier().unwrap();
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn test_builder_constructs_for_both_modes() {
        let store = TrustStore::bundled();
        assert!(store
            .client_builder(VerifyMode::Relaxed)
            .unwrap()
            .build()
            .is_ok());
        assert!(store
            .client_builder(VerifyMode::None)
            .unwrap()
            .build()
            .is_ok());
    }
}
