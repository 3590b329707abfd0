//! TLS connector construction for `https` targets.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::HttpError;
use volley_core::TlsConf;

/// Build a connector honoring the configured cipher suites, protocol
/// versions and verification policy.
pub fn build_connector(conf: &TlsConf) -> Result<TlsConnector, HttpError> {
    let mut provider = ring::default_provider();
    if !conf.cipher_suites.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            conf.cipher_suites.iter().any(|wanted| wanted == &name)
        });
        if provider.cipher_suites.is_empty() {
            return Err(HttpError::Tls(format!(
                "no usable cipher suites among {:?}",
                conf.cipher_suites
            )));
        }
    }

    let versions = protocol_versions(conf);
    let provider = Arc::new(provider);
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)
        .map_err(|e| HttpError::Tls(e.to_string()))?;

    let config = if conf.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new(&provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn protocol_versions(conf: &TlsConf) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let rank = |name: &str| match name {
        "" => None,
        "TLS12" | "TLS1.2" => Some(2u8),
        "TLS13" | "TLS1.3" => Some(3u8),
        other => {
            tracing::warn!("Unsupported TLS version {:?}, ignoring", other);
            None
        }
    };

    let min = rank(&conf.min_version).unwrap_or(2);
    let max = rank(&conf.max_version).unwrap_or(3);

    let mut versions = Vec::new();
    if min <= 2 && max >= 2 {
        versions.push(&rustls::version::TLS12);
    }
    if min <= 3 && max >= 3 {
        versions.push(&rustls::version::TLS13);
    }
    if versions.is_empty() {
        tracing::warn!(
            "TLS version range {:?}..{:?} is empty, falling back to defaults",
            conf.min_version,
            conf.max_version
        );
        versions = vec![&rustls::version::TLS12, &rustls::version::TLS13];
    }
    versions
}

/// Verifier that accepts any certificate (`InsecureSkipVerify`).
#[derive(Debug)]
struct InsecureVerifier {
    schemes: Vec<SignatureScheme>,
}

impl InsecureVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
