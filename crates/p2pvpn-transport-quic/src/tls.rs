//! Mutual TLS with pinned peer identities
//!
//! Certificates are self-signed, so chain validation is replaced by identity
//! pinning: the dialer accepts the server only if the certificate hashes to the
//! expected peer id, and the listener accepts any client certificate and
//! reports its hash as the remote peer id. Handshake signatures are always
//! verified, which proves the remote holds the key of the presented
//! certificate.

use crate::identity::Identity;
use p2pvpn_transport::{PeerId, TransportError, TransportResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::sync::{Arc, Once};

/// ALPN protocol spoken on tunnel connections
pub(crate) const ALPN: &[u8] = b"p2pvpn/1";

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Install ring as the process-wide rustls provider (idempotent)
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts a server certificate only if it hashes to the expected peer id
#[derive(Debug)]
struct PinnedPeerVerifier {
    expected: PeerId,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedPeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = PeerId::from_certificate_der(end_entity);
        if actual != self.expected {
            return Err(rustls::Error::General(format!(
                "peer identity mismatch: expected {}, got {}",
                self.expected, actual
            )));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
        verify_tls13_signature(
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

/// Requires a client certificate but lets the tunnel decide who is allowed
#[derive(Debug)]
struct AnyPeerVerifier {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AnyPeerVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
        verify_tls13_signature(
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

/// Client configuration for dialing `expected`
pub(crate) fn client_config(
    identity: &Identity,
    expected: &PeerId,
    transport: Arc<quinn::TransportConfig>,
) -> TransportResult<quinn::ClientConfig> {
    let verifier = Arc::new(PinnedPeerVerifier {
        expected: expected.clone(),
        provider: provider(),
    });

    let mut client_crypto = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::TlsError(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.cert_chain(), identity.private_key())
        .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .map_err(|e| TransportError::TlsError(e.to_string()))?,
    ));
    client_config.transport_config(transport);

    Ok(client_config)
}

/// Server configuration presenting `identity` and requiring client certificates
pub(crate) fn server_config(
    identity: &Identity,
    transport: Arc<quinn::TransportConfig>,
) -> TransportResult<quinn::ServerConfig> {
    let verifier = Arc::new(AnyPeerVerifier {
        provider: provider(),
    });

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::TlsError(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain(), identity.private_key())
        .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| TransportError::TlsError(e.to_string()))?,
    ));
    server_config.transport_config(transport);

    Ok(server_config)
}

/// Peer id proven by the remote side of an established connection
pub(crate) fn remote_peer_id(connection: &quinn::Connection) -> TransportResult<PeerId> {
    let certs = connection
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
        .ok_or_else(|| TransportError::TlsError("Peer presented no certificate".to_string()))?;

    certs
        .first()
        .map(|cert| PeerId::from_certificate_der(cert))
        .ok_or_else(|| TransportError::TlsError("Peer presented an empty chain".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_verifier_rejects_other_certificates() {
        let expected = Identity::generate().unwrap();
        let other = Identity::generate().unwrap();
        let verifier = PinnedPeerVerifier {
            expected: expected.peer_id().clone(),
            provider: provider(),
        };
        let name = ServerName::try_from("p2pvpn").unwrap();

        let ok = verifier.verify_server_cert(
            &expected.cert_chain()[0],
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(ok.is_ok());

        let err = verifier.verify_server_cert(
            &other.cert_chain()[0],
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_configs_build_from_generated_identity() {
        let identity = Identity::generate().unwrap();
        let transport = Arc::new(quinn::TransportConfig::default());

        assert!(client_config(&identity, identity.peer_id(), transport.clone()).is_ok());
        assert!(server_config(&identity, transport).is_ok());
    }
}
