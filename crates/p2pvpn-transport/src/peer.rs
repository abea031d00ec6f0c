//! Peer identities and dialable peer addresses

use crate::TransportError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Identity of a tunnel peer
///
/// Transports derive it from key material the remote proves ownership of
/// during the handshake, so two streams with equal `PeerId`s come from the
/// same principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Derive a peer id from a DER-encoded certificate (hex SHA-256)
    pub fn from_certificate_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidPeerId("empty peer id".to_string()));
        }

        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(TransportError::InvalidPeerId(format!(
                "unexpected character {:?} in {}",
                c, s
            )));
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// A peer id together with a network address it can be reached at
///
/// Text form: `<peer-id>@<host:port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub peer: PeerId,
    pub address: String,
}

impl PeerAddr {
    pub fn new(peer: PeerId, address: impl Into<String>) -> Self {
        Self {
            peer,
            address: address.into(),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer, self.address)
    }
}

impl FromStr for PeerAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer, address) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| TransportError::InvalidPeerAddr(format!("missing '@' in {}", s)))?;

        if address.rsplit_once(':').map_or(true, |(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            return Err(TransportError::InvalidPeerAddr(format!(
                "expected host:port after '@' in {}",
                s
            )));
        }

        Ok(Self {
            peer: peer.parse()?,
            address: address.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_certificate_is_stable_hex() {
        let a = PeerId::from_certificate_der(b"certificate bytes");
        let b = PeerId::from_certificate_der(b"certificate bytes");
        let c = PeerId::from_certificate_der(b"other certificate");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_peer_id_parse_normalizes_case() {
        let id: PeerId = "  ABCdef01 ".parse().unwrap();
        assert_eq!(id.as_str(), "abcdef01");
    }

    #[test]
    fn test_peer_id_parse_rejects_garbage() {
        assert!("".parse::<PeerId>().is_err());
        assert!("peer id".parse::<PeerId>().is_err());
        assert!("a@b".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_short() {
        let id = PeerId::from_certificate_der(b"x");
        assert_eq!(id.short().len(), 12);

        let tiny: PeerId = "ab".parse().unwrap();
        assert_eq!(tiny.short(), "ab");
    }

    #[test]
    fn test_peer_addr_roundtrip() {
        let addr: PeerAddr = "deadbeef@203.0.113.7:4433".parse().unwrap();
        assert_eq!(addr.peer.as_str(), "deadbeef");
        assert_eq!(addr.address, "203.0.113.7:4433");
        assert_eq!(addr.to_string(), "deadbeef@203.0.113.7:4433");
    }

    #[test]
    fn test_peer_addr_accepts_hostnames_and_ipv6() {
        let addr: PeerAddr = "peer-b@vpn.example.com:4433".parse().unwrap();
        assert_eq!(addr.address, "vpn.example.com:4433");

        let addr: PeerAddr = "peer-b@[2001:db8::1]:4433".parse().unwrap();
        assert_eq!(addr.address, "[2001:db8::1]:4433");
    }

    #[test]
    fn test_peer_addr_rejects_missing_parts() {
        assert!("deadbeef".parse::<PeerAddr>().is_err());
        assert!("deadbeef@host".parse::<PeerAddr>().is_err());
        assert!("deadbeef@:4433".parse::<PeerAddr>().is_err());
        assert!("@host:4433".parse::<PeerAddr>().is_err());
    }
}
