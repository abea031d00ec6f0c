//! Peer identity: a self-signed certificate and its key
//!
//! The peer id is the SHA-256 of the certificate DER, so publishing the id is
//! enough for the other side to pin the certificate.

use p2pvpn_transport::{PeerId, TransportError, TransportResult};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Certificate file name inside an identity directory
pub const CERT_FILE: &str = "identity.crt";

/// Private key file name inside an identity directory
pub const KEY_FILE: &str = "identity.key";

/// Name presented in certificates and used as the TLS server name
pub(crate) const SERVER_NAME: &str = "p2pvpn";

pub struct Identity {
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    cert_pem: String,
    key_pem: String,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a fresh identity
    pub fn generate() -> TransportResult<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| TransportError::TlsError(format!("Key generation failed: {}", e)))?;

        let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()]).map_err(|e| {
            TransportError::TlsError(format!("Certificate generation failed: {}", e))
        })?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "p2pvpn peer");
        params.distinguished_name = dn;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            TransportError::TlsError(format!("Certificate generation failed: {}", e))
        })?;

        let cert_der = cert.der().clone();
        let peer_id = PeerId::from_certificate_der(&cert_der);

        Ok(Self {
            cert_der,
            key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            peer_id,
        })
    }

    /// Load an identity previously written with [`Identity::save`]
    pub fn load(dir: &Path) -> TransportResult<Self> {
        let (cert_path, key_path) = Self::paths(dir);

        let cert_pem = fs::read_to_string(&cert_path).map_err(|e| {
            TransportError::TlsError(format!("Failed to read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read_to_string(&key_path).map_err(|e| {
            TransportError::TlsError(format!("Failed to read {}: {}", key_path.display(), e))
        })?;

        let cert_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .next()
            .ok_or_else(|| {
                TransportError::TlsError(format!("No certificate in {}", cert_path.display()))
            })?
            .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

        let key_der = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
            .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))?;

        let peer_id = PeerId::from_certificate_der(&cert_der);

        Ok(Self {
            cert_der,
            key_der,
            cert_pem,
            key_pem,
            peer_id,
        })
    }

    /// Write certificate and key as PEM files into `dir`
    ///
    /// Refuses to replace an existing identity unless `overwrite` is set.
    pub fn save(&self, dir: &Path, overwrite: bool) -> TransportResult<()> {
        let (cert_path, key_path) = Self::paths(dir);

        if !overwrite && (cert_path.exists() || key_path.exists()) {
            return Err(TransportError::ConfigurationError(format!(
                "An identity already exists in {}",
                dir.display()
            )));
        }

        fs::create_dir_all(dir)?;
        fs::write(&cert_path, &self.cert_pem)?;
        fs::write(&key_path, &self.key_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub(crate) fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone()]
    }

    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key_der.clone_key()
    }

    fn paths(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join(CERT_FILE), dir.join(KEY_FILE))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_ids() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();

        assert_ne!(a.peer_id(), b.peer_id());
        assert_eq!(a.peer_id().as_str().len(), 64);
        assert!(a.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(a.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_save_and_load_keep_the_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::generate().unwrap();
        identity.save(dir.path(), false).unwrap();

        let loaded = Identity::load(dir.path()).unwrap();
        assert_eq!(loaded.peer_id(), identity.peer_id());
        assert_eq!(loaded.cert_chain(), identity.cert_chain());
    }

    #[test]
    fn test_save_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        Identity::generate().unwrap().save(dir.path(), false).unwrap();

        let second = Identity::generate().unwrap();
        assert!(second.save(dir.path(), false).is_err());
        second.save(dir.path(), true).unwrap();
        assert_eq!(Identity::load(dir.path()).unwrap().peer_id(), second.peer_id());
    }

    #[test]
    fn test_load_missing_identity_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Identity::load(dir.path()),
            Err(TransportError::TlsError(_))
        ));
    }

    #[test]
    fn test_identity_works_with_rustls() {
        let identity = Identity::generate().unwrap();
        let config = rustls::ServerConfig::builder_with_provider(std::sync::Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain(), identity.private_key());

        assert!(config.is_ok());
    }
}
