//! Tunnel Protocol Definitions
//!
//! This crate defines the wire format shared by both tunnel endpoints:
//! the length-prefixed frame codec, the frame size limits and the protocol
//! identifiers advertised to the transport layer.

pub mod codec;

pub use codec::{FrameCodec, FrameError};

/// Largest MTU a tunneled interface may be configured with
pub const MAX_MTU: usize = 1500;

/// Allowance for the link-layer header carried in TAP mode
pub const ETHERNET_MINIMUM_SIZE: usize = 64;

/// Maximum frame size accepted on the wire (1564 bytes)
pub const MAX_FRAME_SIZE: usize = MAX_MTU + ETHERNET_MINIMUM_SIZE;

/// Size of the little-endian length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Memory reserved per inbound stream: one maximum frame plus its prefix
pub const STREAM_BUDGET: usize = MAX_FRAME_SIZE + LENGTH_PREFIX_SIZE;

/// Service name used to tag tunnel streams for resource accounting
pub const SERVICE_NAME: &str = "p2pvpn";

/// Protocol identifier for link-layer (TAP) tunnels
pub const PROTOCOL_TAP: &str = "/vpn/tap/1.0.0";

/// Protocol identifier for network-layer (TUN) tunnels
pub const PROTOCOL_TUN: &str = "/vpn/tun/1.0.0";

/// Select the protocol identifier for an interface's link mode.
///
/// Both endpoints must run in the same mode for their streams to meet.
pub fn protocol_id(link_layer: bool) -> &'static str {
    if link_layer {
        PROTOCOL_TAP
    } else {
        PROTOCOL_TUN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_id_by_mode() {
        assert_eq!(protocol_id(true), "/vpn/tap/1.0.0");
        assert_eq!(protocol_id(false), "/vpn/tun/1.0.0");
        assert_ne!(protocol_id(true), protocol_id(false));
    }

    #[test]
    fn test_frame_limits() {
        assert_eq!(MAX_FRAME_SIZE, 1564);
        assert_eq!(STREAM_BUDGET, 1566);
        assert!(MAX_FRAME_SIZE <= u16::MAX as usize);
    }
}
