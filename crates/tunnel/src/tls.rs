//! TLS material for the secondary transport.
//!
//! The slave generates a self-signed ECDSA-P256 certificate valid for 24
//! hours and advertises its SHA-256 fingerprint over the already
//! authenticated primary transport. The master dials with verification
//! replaced by a fingerprint check, so trust is inherited from the outer
//! channel rather than from any CA.

use std::sync::Arc;

use ring::digest;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tracing::debug;

use common::{Error, Result};

/// ALPN protocol id for the tunnel.
const ALPN: &[u8] = b"mpf-0";

/// Ephemeral server identity: DER certificate, DER key, hex fingerprint.
pub struct EphemeralCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub fingerprint: String,
}

/// Generate the slave's ephemeral certificate.
pub fn generate_ephemeral_cert() -> Result<EphemeralCert> {
    // rcgen's default algorithm is ECDSA P-256 with SHA-256.
    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| Error::Transport(format!("key generation failed: {e}")))?;

    let mut params = rcgen::CertificateParams::new(vec!["mpf".to_string()])
        .map_err(|e| Error::Transport(format!("cert params failed: {e}")))?;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::hours(24);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Transport(format!("self-signing failed: {e}")))?;

    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();
    let fingerprint = fingerprint_hex(&cert_der);

    debug!(fingerprint = %&fingerprint[..16], "generated ephemeral certificate");

    Ok(EphemeralCert {
        cert_der,
        key_der,
        fingerprint,
    })
}

/// Hex SHA-256 over a DER certificate.
pub fn fingerprint_hex(cert_der: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, cert_der).as_ref())
}

/// QUIC server config presenting the ephemeral certificate.
pub fn server_config(cert: &EphemeralCert) -> Result<quinn::ServerConfig> {
    let cert_der = CertificateDer::from(cert.cert_der.clone());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_der.clone()));

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key)
        .map_err(|e| Error::Transport(format!("server TLS config failed: {e}")))?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| Error::Transport(format!("QUIC server config failed: {e}")))?,
    ));
    config.transport_config(Arc::new(transport_config()?));

    Ok(config)
}

/// QUIC client config that accepts exactly the certificate whose DER hashes
/// to `expected_fingerprint` (lowercase hex).
pub fn client_config(expected_fingerprint: &str) -> Result<quinn::ClientConfig> {
    let expected = hex::decode(expected_fingerprint)
        .map_err(|e| Error::Handshake(format!("malformed tls_hash: {e}")))?;
    if expected.len() != 32 {
        return Err(Error::Handshake(format!(
            "malformed tls_hash: expected 32 bytes, got {}",
            expected.len()
        )));
    }

    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintVerifier { expected }))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_client_config = quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
        .map_err(|e| Error::Transport(format!("QUIC client config failed: {e}")))?;

    let mut config = quinn::ClientConfig::new(Arc::new(quic_client_config));
    config.transport_config(Arc::new(transport_config()?));

    Ok(config)
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_secs(60))
            .map_err(|e| Error::Transport(format!("invalid idle timeout: {e}")))?,
    ));
    // QUIC-level keep-alives ride below the session heartbeat so an idle
    // but healthy tunnel never hits the idle timeout.
    transport.keep_alive_interval(Some(std::time::Duration::from_secs(15)));
    Ok(transport)
}

/// Verifier that pins the server's leaf certificate by SHA-256 digest.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Vec<u8>,
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let actual = digest::digest(&digest::SHA256, end_entity.as_ref());
        if actual.as_ref() == self.expected.as_slice() {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                hex::encode(&self.expected),
                hex::encode(actual.as_ref()),
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
