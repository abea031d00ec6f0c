//! QUIC transport implementation using quinn
//!
//! Each peer owns a self-signed certificate; its peer id is the SHA-256 of the
//! certificate. Connections use mutual TLS 1.3: the dialer pins the id it was
//! given, the listener learns the dialer's id from its client certificate.
//! Every tunnel stream is one QUIC bidirectional stream, prefixed with a
//! one-byte length and the protocol id it speaks.
//!
//! # Example
//!
//! ```no_run
//! use p2pvpn_transport::{PeerAddr, StreamHost};
//! use p2pvpn_transport_quic::{Identity, QuicHost, QuicHostConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = Identity::generate()?;
//! let host = QuicHost::bind(identity, QuicHostConfig::new("0.0.0.0:4001".parse()?))?;
//!
//! let remote: PeerAddr = "3f2a...c9@203.0.113.7:4001".parse()?;
//! host.connect(&remote).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod host;
pub mod identity;
pub mod stream;
pub mod tls;

pub use config::QuicHostConfig;
pub use host::QuicHost;
pub use identity::{Identity, CERT_FILE, KEY_FILE};
pub use stream::QuicVpnStream;
pub use tls::ensure_crypto_provider;
