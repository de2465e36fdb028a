//! TLS client configuration and certificate verification
//!
//! Two verification policies: a pinned SHA-1 fingerprint of the server's
//! leaf certificate, which bypasses the trust store entirely, or the
//! default chain + hostname validation against the bundled web roots.

use maildrain_common::config::TlsConfig;
use maildrain_common::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::{error, info};

/// SNI name for the configured host.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::Tls(format!("Invalid host for TLS SNI: {}", host)))
}

/// Assemble the client TLS configuration for this session.
pub fn client_config(cfg: &TlsConfig) -> Result<ClientConfig> {
    let provider = Arc::new(build_provider(cfg)?);

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build certificate verifier: {}", e)))?;

    let verifier = Arc::new(CertVerifier {
        pin: cfg.fingerprint.as_deref().map(normalize_fingerprint),
        inner: webpki,
    });

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Failed to assemble TLS config: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(config)
}

/// Build the crypto provider, optionally narrowed to the configured
/// cipher-suite allowlist.
fn build_provider(cfg: &TlsConfig) -> Result<CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !cfg.cipher.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            cfg.cipher.iter().any(|want| want.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(Error::Tls(format!(
                "No cipher suite matches the configured list: {}",
                cfg.cipher.join(":")
            )));
        }
    }
    Ok(provider)
}

/// Certificate verifier with optional leaf pinning.
///
/// When a pin is configured the decision is made on the leaf alone; the
/// rest of the chain is neither needed nor consulted. Without a pin, the
/// inner WebPKI verifier performs full chain + hostname validation.
#[derive(Debug)]
struct CertVerifier {
    pin: Option<String>,
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for CertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        for (pos, cert) in std::iter::once(end_entity)
            .chain(intermediates.iter())
            .enumerate()
        {
            info!(
                "SHA1 fingerprint of certificate (position {}): {}",
                pos + 1,
                sha1_hex(cert.as_ref())
            );
        }

        if let Some(pin) = &self.pin {
            info!("Verifying fingerprint ...");
            let fingerprint = sha1_hex(end_entity.as_ref());
            if pin == &fingerprint {
                info!("Fingerprint matches. Authentication finished.");
                Ok(ServerCertVerified::assertion())
            } else {
                error!(
                    "Given fingerprint {} does not match the one of the certificate: {}",
                    pin, fingerprint
                );
                Err(rustls::Error::General(
                    "certificate fingerprint does not match".to_string(),
                ))
            }
        } else {
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map_err(|e| {
                    error!("Certificate verification failed: {}", e);
                    e
                })
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Upper-hex SHA-1 of a DER certificate.
fn sha1_hex(der: &[u8]) -> String {
    Sha1::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

/// Normalize a configured fingerprint: strip separators, uppercase.
fn normalize_fingerprint(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .collect::<String>()
        .to_ascii_uppercase()
}
